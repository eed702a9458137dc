pub mod extraction;

pub use extraction::{ExtractedReceipt, ReceiptExtractor};
