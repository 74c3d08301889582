//! Optional packet transforms
//!
//! | Module        | Layer order | Description                               |
//! |---------------|-------------|-------------------------------------------|
//! | `compression` | 1st         | zstd payload compression (feature-gated)  |
//! | `fragment`    | 2nd         | datagram fragmentation and reassembly     |
//!
//! Both run before encryption on the way out and after decryption on the
//! way in, so their headers are authenticated.

#[cfg(feature = "compression")]
mod compression;
mod fragment;

#[cfg(feature = "compression")]
pub use compression::*;
pub use fragment::*;
