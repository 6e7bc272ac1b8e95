//! Hard limits enforced before any state is touched.

use crate::model::Hz;

pub const MAX_BANDS_PER_TENANT: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_HOLDER_LEN: usize = 256;
pub const MAX_CONTACT_LEN: usize = 320;

/// Upper bound for any frequency value (1 PHz). Keeps grid arithmetic far from i64 overflow.
pub const MAX_FREQUENCY_HZ: Hz = 1_000_000_000_000_000;

/// Max channels a single request may ask for, or confirm in one batch.
pub const MAX_CHANNELS_PER_REQUEST: usize = 10_000;

/// Max grid points a single request may scan.
pub const MAX_GRID_SCAN: u64 = 1_000_000;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;
