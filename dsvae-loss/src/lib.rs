pub mod candle_aggregate;
pub mod candle_latent_dist;
pub mod candle_log_density;
pub mod candle_loss_config;
pub mod candle_loss_functions;
pub mod candle_windowed_prior;
pub mod candle_windows;
pub mod cli;

pub use candle_core;
pub use candle_nn;
