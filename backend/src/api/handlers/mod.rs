//! HTTP request handlers.

pub mod backups;
pub mod health;
pub mod schedules;

#[cfg(test)]
pub(crate) mod test_support;
