//! Authentication module for PopMitra server
//!
//! Signup with one-time-code verification, sign-in by code or password,
//! and session token issuance.

mod contact;
pub mod handlers;
pub mod otp;
mod password;
pub mod pending;
pub mod provisioner;
mod rate_limit;
mod service;

pub use contact::Contact;
pub use otp::{OtpDispatcher, OtpService};
pub use password::{hash_password, verify_password};
pub use pending::PendingRegistrations;
pub use provisioner::AccountProvisioner;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use service::{AuthService, Claims, CodeSent, Session};
