// External service adapters.

pub mod email;

pub use email::{LogOnlyMailer, SmtpMailer};
