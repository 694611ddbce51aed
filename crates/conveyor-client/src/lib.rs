pub mod fetcher;
pub mod links;

pub use fetcher::ReqwestFetcher;
pub use links::{extract_links, same_host};
