//! CRM execution capability for the MCP gateway.
//!
//! Provides:
//! - `HttpCapability` - Forwards `execute(domain, operation, params)` to the CRM API
//! - Tool catalog describing which domain operations are exposed as tools

pub mod catalog;
pub mod http;

pub use catalog::{ToolSpec, default_catalog};
pub use http::{CapabilityError, CrmConfig, HttpCapability};
