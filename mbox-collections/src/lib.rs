pub mod error;
pub mod mail;
pub mod notifier;

pub use error::{MailError, Result};
pub use mail::account::Account;
pub use mail::collection::{Collection, FlagMode};
pub use mail::incoming::{Decryptor, IncomingSource, SealedBoxDecryptor};
pub use mail::mailbox::{Mailbox, MailboxStatus};
pub use notifier::{Listener, Notifier};
