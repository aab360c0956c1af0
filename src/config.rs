//! Store configuration
//!
//! Environment-backed arguments for the records store. The struct is
//! `#[command(flatten)]`-able into a host binary's argument parser.

use clap::Parser;

use crate::record::RECORD_COLLECTION;

/// MongoDB connection settings for the record graph
#[derive(Parser, Debug, Clone)]
pub struct StoreArgs {
    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "watchtower")]
    pub mongodb_db: String,

    /// Collection holding the record graph
    #[arg(long, env = "RECORDS_COLLECTION", default_value = RECORD_COLLECTION)]
    pub records_collection: String,
}

impl StoreArgs {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.mongodb_db.is_empty() {
            return Err("MONGODB_DB must not be empty".to_string());
        }

        if self.records_collection.is_empty() {
            return Err("RECORDS_COLLECTION must not be empty".to_string());
        }

        Ok(())
    }
}
