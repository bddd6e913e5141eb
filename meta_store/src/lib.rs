mod store_db;

pub use store_db::*;
