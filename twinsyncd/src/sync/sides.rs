use std::sync::Arc;

use twinsync_core::Provider;

use super::job::Side;

/// The two peer providers, addressed by [`Side`].
#[derive(Clone)]
pub struct Sides {
    a: Arc<dyn Provider>,
    b: Arc<dyn Provider>,
}

impl Sides {
    pub fn new(a: Arc<dyn Provider>, b: Arc<dyn Provider>) -> Self {
        Self { a, b }
    }

    pub fn get(&self, side: Side) -> &Arc<dyn Provider> {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }
}
