pub mod config;
pub mod contact;
pub mod contacts;
pub mod error;
pub mod help;
pub mod ledger;
pub mod migrate;
pub mod page;
pub mod photo;
pub mod store;
pub mod supabase;

pub use error::{CrmError, Result};
