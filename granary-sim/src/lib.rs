//! In-process log and overlay fabric
//!
//! One [`SimNet`] is a shared hub: every participant that opens logs through
//! its [`LogOpener`] or joins overlays through its per-identity [`Overlay`]
//! handle sees the same data, with live tails and peer counts, without any
//! real networking. Trust gating is enforced the same way a real overlay
//! would: joining a foreign feed requires a verifiable link from the feed
//! owner to the joining identity.

mod log;
mod overlay;

pub use log::SimLogOpener;
pub use overlay::SimOverlay;

use granary_model::{FeedKey, LogOpener, Overlay};
use std::sync::Arc;

/// The shared fabric. Clone the `Arc`; hand out per-identity views.
pub struct SimNet {
    log_hub: Arc<log::LogHub>,
    overlay_hub: Arc<overlay::OverlayHub>,
}

impl SimNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log_hub: Arc::new(log::LogHub::default()),
            overlay_hub: Arc::new(overlay::OverlayHub::default()),
        })
    }

    /// A log opener backed by this hub. All openers of one hub replicate
    /// instantly from each other.
    pub fn log_opener(&self) -> Arc<dyn LogOpener> {
        Arc::new(SimLogOpener::new(self.log_hub.clone()))
    }

    /// An overlay view for one identity. Join decisions are made against
    /// this identity.
    pub fn overlay(&self, identity: FeedKey) -> Arc<dyn Overlay> {
        Arc::new(SimOverlay::new(self.overlay_hub.clone(), identity))
    }
}
