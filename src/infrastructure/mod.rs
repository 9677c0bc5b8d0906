pub mod auction_repo;
pub mod memory;
pub mod models;
pub mod outbox_repo;
pub mod search_repo;

#[cfg(test)]
pub(crate) mod test_support;
