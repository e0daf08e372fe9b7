mod config;
mod dispatch;
mod eviction;
