pub mod crawl;
pub mod db_counts;
