pub mod api;
pub mod bulk;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod sanctions;

pub mod graph {
    pub mod memory;
    pub mod postgres;
    pub mod snapshot;
    pub mod store;
    #[cfg(test)]
    pub mod testing;
    pub mod types;
}

pub mod detection {
    pub mod engine;
    pub mod fraud;
    pub mod laundering;
    pub mod types;
}

pub mod scoring {
    pub mod risk;
}

pub mod automation {
    pub mod controller;
    pub mod crawler;
    pub mod expansion;
    pub mod jobs;
    pub mod monitor;
}
