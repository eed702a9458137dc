pub mod avatar;
pub mod models;
pub mod repository;
pub mod session;

pub use models::{PendingProfileUpdate, User, UserRole};
pub use repository::{UserRepository, USERS_COLLECTION};
pub use session::SessionManager;
