pub mod attr;
pub mod row;
pub mod schema;
