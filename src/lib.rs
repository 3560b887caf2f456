pub mod agent;
pub mod config;
pub mod export;
pub mod ingress;
pub mod pid;
pub mod pipeline;
pub mod sampler;
pub mod sink;
