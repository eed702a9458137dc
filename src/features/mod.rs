pub mod expenses;
pub mod receipts;
pub mod users;
