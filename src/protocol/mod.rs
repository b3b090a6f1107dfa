//! Wire formats spoken by the embedding server

pub mod http;

pub use http::{
    EmbedInput, HealthResponse, HttpBatchEmbedResponse, HttpBatchItem, HttpEmbedRequest,
    HttpEmbedResponse, HttpErrorResponse, StatsResponse,
};
