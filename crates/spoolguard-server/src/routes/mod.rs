//! Route groups: the token API under `/api/v1`, the session-authenticated
//! browser surface, and the kiosk console.

pub mod api_v1;
pub mod kiosk;
pub mod web;
