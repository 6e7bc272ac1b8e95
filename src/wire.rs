use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, OccupancyFilter, RangeFilter, ResultShape};
use crate::tenant::TenantManager;
use crate::units::format_mhz;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(FreqdFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct FreqdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<FreqdQueryParser>,
}

impl FreqdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(FreqdQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertBand {
                id,
                name,
                from,
                to,
                spacing,
            } => {
                engine
                    .create_band(id, name, from, to, spacing)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBand { id } => {
                engine.delete_band(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBands { id } => {
                let bands = match id {
                    Some(id) => engine.get_band(&id).into_iter().collect(),
                    None => engine.list_bands(),
                };
                rows(ResultShape::Bands, &bands, |encoder, band| {
                    encoder.encode_field(&band.id.to_string())?;
                    encoder.encode_field(&band.name)?;
                    encoder.encode_field(&band.from)?;
                    encoder.encode_field(&band.to)?;
                    encoder.encode_field(&band.spacing)?;
                    encoder.encode_field(&(band.channel_count() as i64))
                })
            }
            Command::Allocate { request, holder } => {
                let outcome = engine.allocate(request, &holder).await.map_err(engine_err)?;
                outcome_rows(&outcome)
            }
            Command::PreviewSpaced {
                band_id,
                range,
                count,
                fine_spacing,
            } => {
                let range = band_range(engine, &band_id, range)?;
                let outcome = engine
                    .preview_spaced(band_id, range, count, fine_spacing)
                    .await
                    .map_err(engine_err)?;
                outcome_rows(&outcome)
            }
            Command::Confirm { values, holder } => {
                let outcome = engine.confirm(&values, &holder).await.map_err(engine_err)?;
                outcome_rows(&outcome)
            }
            Command::Deallocate {
                band_id,
                range,
                holder,
            } => {
                let range = band_range(engine, &band_id, range)?;
                let released = engine
                    .deallocate_range(band_id, range, &holder)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(released)))
            }
            Command::Debar { band_id, range } => {
                let range = band_range(engine, &band_id, range)?;
                let outcome = engine.debar_range(band_id, range).await.map_err(engine_err)?;
                outcome_rows(&outcome)
            }
            Command::Allow { band_id, range } => {
                let range = band_range(engine, &band_id, range)?;
                let freed = engine.allow_range(band_id, range).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(freed)))
            }
            Command::ReleaseChannel { value } => {
                engine.release_channel(value).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::ReleaseHolder { holder } => {
                let released = engine.release_holder(&holder).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(released)))
            }
            Command::SelectAvailable { band_id, range } => {
                let range = band_range(engine, &band_id, range)?;
                let free = engine
                    .available_channels(band_id, range)
                    .await
                    .map_err(engine_err)?;
                rows(ResultShape::Available, &free, |encoder, value| {
                    encoder.encode_field(value)?;
                    encoder.encode_field(&format_mhz(*value))
                })
            }
            Command::SelectChannels { band_id, range } => {
                let range = band_range(engine, &band_id, range)?;
                let table = engine.channel_table(band_id, range).await.map_err(engine_err)?;
                rows(ResultShape::Channels, &table, |encoder, status| {
                    encoder.encode_field(&status.value())?;
                    encoder.encode_field(&format_mhz(status.value()))?;
                    encoder.encode_field(&status.label())?;
                    encoder.encode_field(&status.record().map(|r| r.holder.clone()))?;
                    encoder.encode_field(&status.record().map(|r| r.contact.clone()))
                })
            }
            Command::SelectOccupancy { filter } => {
                let records = match filter {
                    OccupancyFilter::All => engine.all_occupancy().await,
                    OccupancyFilter::Range(range) => {
                        engine.occupancy_in_range(range).await.map_err(engine_err)?
                    }
                    OccupancyFilter::Holder(holder) => engine.holdings(&holder).await,
                };
                rows(ResultShape::Occupancy, &records, |encoder, r| {
                    encode_assignment(encoder, r.value, &r.holder, &r.contact, r.location, r.created_at)
                })
            }
            Command::SelectHistory { value } => {
                let history = engine.history(value).await;
                rows(ResultShape::History, &history, |encoder, h| {
                    encode_assignment(encoder, h.value, &h.holder, &h.contact, h.location, h.created_at)
                })
            }
        }
    }
}

/// Resolve optional bounds against the band's edges.
fn band_range(engine: &Engine, band_id: &Ulid, range: RangeFilter) -> PgWireResult<ChannelRange> {
    let band = engine
        .get_band(band_id)
        .ok_or_else(|| engine_err(EngineError::BandNotFound(*band_id)))?;
    Ok(range.within(&band))
}

// ── Result encoding ──────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn schema(shape: ResultShape) -> Vec<FieldInfo> {
    match shape {
        ResultShape::NoRows => vec![],
        ResultShape::Bands => vec![
            field("id", Type::VARCHAR),
            field("name", Type::VARCHAR),
            field("from", Type::INT8),
            field("to", Type::INT8),
            field("spacing", Type::INT8),
            field("channels", Type::INT8),
        ],
        ResultShape::Outcome => vec![
            field("value", Type::INT8),
            field("mhz", Type::VARCHAR),
            field("status", Type::VARCHAR),
            field("message", Type::VARCHAR),
        ],
        ResultShape::Available => vec![field("value", Type::INT8), field("mhz", Type::VARCHAR)],
        ResultShape::Channels => vec![
            field("value", Type::INT8),
            field("mhz", Type::VARCHAR),
            field("status", Type::VARCHAR),
            field("holder", Type::VARCHAR),
            field("contact", Type::VARCHAR),
        ],
        ResultShape::Occupancy | ResultShape::History => vec![
            field("value", Type::INT8),
            field("mhz", Type::VARCHAR),
            field("holder", Type::VARCHAR),
            field("contact", Type::VARCHAR),
            field("latitude", Type::FLOAT8),
            field("longitude", Type::FLOAT8),
            field("created_at", Type::INT8),
        ],
    }
}

fn rows<T>(
    shape: ResultShape,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema(shape));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// One row per value; every row repeats the outcome's status and message.
fn outcome_rows(outcome: &AllocationOutcome) -> PgWireResult<Response> {
    rows(ResultShape::Outcome, &outcome.values, |encoder, value| {
        encoder.encode_field(value)?;
        encoder.encode_field(&format_mhz(*value))?;
        encoder.encode_field(&outcome.status.label())?;
        encoder.encode_field(&outcome.message)
    })
}

fn encode_assignment(
    encoder: &mut DataRowEncoder,
    value: Hz,
    holder: &str,
    contact: &str,
    location: Location,
    created_at: Ms,
) -> PgWireResult<()> {
    encoder.encode_field(&value)?;
    encoder.encode_field(&format_mhz(value))?;
    encoder.encode_field(&holder)?;
    encoder.encode_field(&contact)?;
    encoder.encode_field(&location.latitude)?;
    encoder.encode_field(&location.longitude)?;
    encoder.encode_field(&created_at)
}

#[async_trait]
impl SimpleQueryHandler for FreqdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FreqdQueryParser;

#[async_trait]
impl QueryParser for FreqdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema(sql::result_shape(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FreqdHandler {
    type Statement = String;
    type QueryParser = FreqdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        self.run(&engine, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema(sql::result_shape(&target.statement)),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema(sql::result_shape(
            &target.statement.statement,
        ))))
    }
}

enum Piece<'a> {
    Text(&'a str),
    Param(usize),
}

/// Split SQL at `$N` placeholders. Quoted literals and identifiers are kept
/// as text, so a `$1` inside `'...'` or `"..."` is not a placeholder.
fn split_params(sql: &str) -> Vec<Piece<'_>> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut quote: Option<u8> = None;
    let mut text_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves it quoted.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let digits_end = bytes[i + 1..]
                    .iter()
                    .position(|c| !c.is_ascii_digit())
                    .map_or(bytes.len(), |n| i + 1 + n);
                if let Ok(n) = sql[i + 1..digits_end].parse::<usize>() {
                    pieces.push(Piece::Text(&sql[text_start..i]));
                    pieces.push(Piece::Param(n));
                    text_start = digits_end;
                    i = digits_end;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    pieces.push(Piece::Text(&sql[text_start..]));
    pieces
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    split_params(sql)
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Param(n) => Some(n),
            Piece::Text(_) => None,
        })
        .max()
        .unwrap_or(0)
}

/// Replace `$1, $2, ...` with bound text-format values as quoted literals,
/// in one pass so bound values are never rescanned.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut result = String::with_capacity(sql.len());
    for piece in split_params(sql) {
        match piece {
            Piece::Text(text) => result.push_str(text),
            Piece::Param(n) => match n.checked_sub(1).and_then(|i| params.get(i)) {
                Some(Some(bytes)) => {
                    let text = String::from_utf8_lossy(bytes.as_ref());
                    result.push('\'');
                    result.push_str(&text.replace('\'', "''"));
                    result.push('\'');
                }
                Some(None) => result.push_str("NULL"),
                // Unbound placeholder stays as written; the parser rejects it.
                None => {
                    result.push('$');
                    result.push_str(&n.to_string());
                }
            },
        }
    }
    result
}

// ── Auth + factory ───────────────────────────────────────────────

/// Single shared password for every user and database.
#[derive(Debug)]
pub struct FreqdAuthSource {
    password: String,
}

impl FreqdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for FreqdAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

pub struct FreqdFactory {
    handler: Arc<FreqdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<FreqdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FreqdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(FreqdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                FreqdAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FreqdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sqlstate(e: &EngineError) -> &'static str {
    if let EngineError::LimitExceeded(_) = e {
        return "54000";
    }
    match e.kind() {
        ErrorKind::Validation => "22023",
        ErrorKind::InsufficientAvailability => "53400",
        ErrorKind::WriteConflict => "23505",
        ErrorKind::NotFound => "P0002",
        ErrorKind::AlreadyExists => "42710",
        ErrorKind::Internal => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if e.kind() == ErrorKind::Internal {
        tracing::error!(error = %e, "engine failure");
    }
    user_error(sqlstate(&e), e.client_message())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM bands"), 0);
        assert_eq!(count_params("DELETE FROM occupancy WHERE value = $1"), 1);
        assert_eq!(count_params("VALUES ($2, $1, $12)"), 12);
        assert_eq!(count_params("costs $ nothing"), 0);
    }

    #[test]
    fn binds_quoted_literals() {
        let params: Vec<Option<&[u8]>> = vec![Some(b"145MHz"), Some(b"o'brien"), None];
        assert_eq!(
            bind_params("VALUES ($1, $2, $3)", &params),
            "VALUES ('145MHz', 'o''brien', NULL)"
        );
    }

    #[test]
    fn binds_double_digit_placeholders() {
        let params: Vec<Option<String>> = (1..=10).map(|i| Some(i.to_string())).collect();
        assert_eq!(bind_params("$1 $10", &params), "'1' '10'");
    }

    #[test]
    fn placeholders_inside_quotes_are_text() {
        assert_eq!(count_params("VALUES ('$3', \"$4\", $1)"), 1);
        let params: Vec<Option<&[u8]>> = vec![Some(b"u"), Some(b"$1")];
        assert_eq!(
            bind_params("VALUES ($1, 'x$1@y.z', $2)", &params),
            "VALUES ('u', 'x$1@y.z', '$1')"
        );
        let params: Vec<Option<&[u8]>> = vec![Some(b"v")];
        assert_eq!(bind_params("VALUES ('it''s $1', $1)", &params), "VALUES ('it''s $1', 'v')");
    }

    #[test]
    fn sqlstate_per_error_kind() {
        assert_eq!(sqlstate(&EngineError::validation("count", "must be at least 1")), "22023");
        assert_eq!(sqlstate(&EngineError::LimitExceeded("too many bands")), "54000");
        assert_eq!(
            sqlstate(&EngineError::InsufficientAvailability {
                available: 1,
                requested: 2
            }),
            "53400"
        );
        assert_eq!(sqlstate(&EngineError::WriteConflict(100)), "23505");
        assert_eq!(sqlstate(&EngineError::ChannelNotFound(100)), "P0002");
        assert_eq!(sqlstate(&EngineError::AlreadyExists(Ulid::nil())), "42710");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "XX000");
    }

    #[test]
    fn schemas_match_shapes() {
        assert!(schema(ResultShape::NoRows).is_empty());
        assert_eq!(schema(ResultShape::Outcome).len(), 4);
        assert_eq!(schema(ResultShape::Occupancy).len(), schema(ResultShape::History).len());
    }
}
