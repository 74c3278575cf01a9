pub mod chat;
pub mod login;

pub use chat::TalkHandler;
pub use login::{SignInHandler, SignOutHandler};
