// Tenant module - tenant binding and per-tenant coordination

pub mod context;
pub mod locks;

pub use context::{TenantContext, TenantId, SYSTEM_RETENTION_ACTOR};
pub use locks::{KeyedMutex, TenantGate};
