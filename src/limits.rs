//! Hard caps that keep one tenant or connection from exhausting the server.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_CLASSROOMS_PER_TENANT: usize = 10_000;
pub const MAX_RESERVATIONS_PER_CLASSROOM: usize = 100_000;

pub const MAX_ROOM_NAME_LEN: usize = 255;
pub const MAX_BUILDING_LEN: usize = 255;
pub const MAX_USER_ID_LEN: usize = 64;
pub const MAX_PURPOSE_LEN: usize = 4096;

/// Channels one connection may LISTEN on at once.
pub const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 64;
