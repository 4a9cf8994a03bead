pub mod events;
pub mod health;
pub mod sessions;
pub mod websocket;

// Re-export all handlers for easy route registration
pub use events::events_websocket_handler;
pub use health::{health_handler, health_live_handler, metrics_handler};
pub use sessions::{
    delete_session, get_session, list_sessions, restart_session, start_session, stop_session,
};
pub use websocket::session_websocket_handler;
