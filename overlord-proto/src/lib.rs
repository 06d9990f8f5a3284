//! Overlord protocol crate.
//!
//! Shared wire types used by both sides of the agent control connection:
//! [`wire`] defines the `Request`/`Response` RPC envelope and its
//! framing-level parsing rule, [`mode`] defines the closed tagged union of
//! connection modes plus registration/spawn payloads, and [`otp`] provides
//! TOTP helpers used by `overlord-web`'s stand-in authenticator. These
//! modules are intentionally minimal and focus on internal protocol needs
//! rather than being general-purpose libraries.
//!
/// One-Time Password generation and verification module
pub mod otp;
/// RPC request/response envelope and framing-level parsing
pub mod wire;
/// Connection modes and registration/spawn payload shapes
pub mod mode;

#[cfg(test)]
mod tests {
    use crate::otp::MyOtp;

    /// Test OTP generation and verification
    #[test]
    fn otp_works() {
        let shared_secret = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";
        let otp_manager = MyOtp::new(shared_secret);
        let current = otp_manager.generate_current();
        let verify = otp_manager.verify(&current);
        assert_eq!(verify, true);
    }
}
