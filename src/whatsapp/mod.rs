//! WhatsApp/Meta adapter: outbound request model, payload builders,
//! conformance validators, log sanitization and the idempotent dispatcher.

mod breaker;
mod builders;
mod http;
mod models;
mod outbound;
mod sanitize;
mod validators;

pub use breaker::{BreakerState, CircuitBreaker};
pub use builders::build_full_payload;
pub use http::HttpSender;
pub use models::{
    ButtonSpec, InteractiveType, MessageCategory, OutboundMessageRequest, OutboundMessageResponse,
    OutboundMessageType,
};
pub use outbound::OutboundClient;
pub use sanitize::sanitize_payload;
pub use validators::{ValidationError, validate_outbound_request, validate_payload};
