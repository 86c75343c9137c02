pub mod account;
pub mod collection;
pub mod incoming;
pub mod mailbox;
pub mod namespace;
