//! Pinherd - durable publishing for content-addressed storage.
//!
//! Pinherd takes local files, adds them to an IPFS node, and drives a
//! redundant pinning protocol against remote pinning services until
//! durability is confirmed - re-announcing the content on the network the
//! whole time so peers can find it before the pin completes. A second,
//! continuously running loop mirrors the pin state of every configured
//! backend into a single dashboard view.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     STORAGE NODE (Kubo)                      │
//! │  Holds and announces actual content; pins locally            │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ add / provide / cat
//! ┌──────────────────────────────┴───────────────────────────────┐
//! │                         PINHERD                              │
//! │  publish:  add → announce loop → pin → poll until confirmed  │
//! │  herd:     fetch every backend → diff → row change events    │
//! │  api:      dashboard snapshot + thumbnails + manual pins     │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ one trait, N services
//! ┌──────────────────────────────┴───────────────────────────────┐
//! │              PUPS (remote pinning services)                  │
//! │  pinata · eternum · pipin - list / pin / unpin               │
//! └──────────────────────────────────────────────────────────────┘
//! ```

// === Core Modules ===

/// Backend adapters over remote pinning services.
pub mod pup;

/// The durable publish pipeline and batch coordinator.
pub mod publish;

/// Multi-backend pin reconciliation.
pub mod herd;

// === Collaborator Clients ===

/// Storage node (Kubo RPC) client.
pub mod ipfs;

/// URL shortening.
pub mod shorten;

// === Presentation & Plumbing ===

/// Dashboard HTTP API.
pub mod api;

/// Process configuration.
pub mod config;

/// Thumbnail rendering.
pub mod thumbnail;
