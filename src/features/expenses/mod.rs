pub mod models;
pub mod repository;

pub use models::{Expense, ExpenseCategory, ExpenseStatus, UpdateExpenseDto};
pub use repository::{ExpenseRepository, EXPENSES_COLLECTION};
