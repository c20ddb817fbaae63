//! Presentation surface rotation.
//!
//! A small N-buffered rotation over a [`SurfaceProvider`]'s surfaces,
//! layered on the same completion discipline as the frame ring: the
//! caller drains all submitted work before `resize` recreates the set.

use tracing::{debug, info};

use framepipe_hal::{Extent2d, Surface, SurfaceProvider};

use crate::error::{PipelineError, PipelineResult};

/// Rotation over a provider's buffered presentation surfaces.
pub struct BackbufferRing {
    provider: Box<dyn SurfaceProvider>,
    surfaces: Vec<Box<dyn Surface>>,
    current: usize,
    extent: Extent2d,
}

impl BackbufferRing {
    /// Creates the ring and the provider's initial surface set.
    pub fn new(mut provider: Box<dyn SurfaceProvider>, extent: Extent2d) -> PipelineResult<Self> {
        let surfaces = provider.recreate(extent.width, extent.height)?;
        if surfaces.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "surface provider produced an empty surface set".to_string(),
            ));
        }
        info!(
            count = surfaces.len(),
            width = extent.width,
            height = extent.height,
            "backbuffer ring created"
        );
        Ok(Self {
            provider,
            surfaces,
            current: 0,
            extent,
        })
    }

    /// The surface the current frame renders into.
    ///
    /// Valid as a render destination for the slot currently being
    /// recorded; presentation of this surface is what rotates the ring.
    #[inline]
    pub fn current_surface(&self) -> &dyn Surface {
        self.surfaces[self.current].as_ref()
    }

    /// Queues the current surface for display and rotates to the next.
    ///
    /// Returns `true` if the provider reported the surface set stale; the
    /// caller should drain and [`resize`](Self::resize).
    pub fn present(&mut self) -> PipelineResult<bool> {
        let stale = self.provider.present(self.surfaces[self.current].as_ref())?;
        self.current = (self.current + 1) % self.surfaces.len();
        Ok(stale)
    }

    /// Destroys and recreates all surfaces at the new extent.
    ///
    /// Must only be called after the frame ring has drained; resizing
    /// while submitted work still references a surface is undefined at
    /// the provider boundary.
    pub fn resize(&mut self, width: u32, height: u32) -> PipelineResult<()> {
        debug!(width, height, "recreating backbuffers");
        self.surfaces = self.provider.recreate(width, height)?;
        if self.surfaces.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "surface provider produced an empty surface set".to_string(),
            ));
        }
        self.current = 0;
        self.extent = Extent2d::new(width, height);
        Ok(())
    }

    /// Number of surfaces in the rotation.
    #[inline]
    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    /// Index of the surface the next present displays.
    #[inline]
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Current surface extent.
    #[inline]
    pub fn extent(&self) -> Extent2d {
        self.extent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framepipe_hal::null::NullSurfaceProvider;

    fn ring(count: usize) -> BackbufferRing {
        BackbufferRing::new(
            Box::new(NullSurfaceProvider::new(count)),
            Extent2d::new(800, 600),
        )
        .unwrap()
    }

    #[test]
    fn test_present_rotates_in_order() {
        let mut ring = ring(3);
        assert_eq!(ring.current_surface().index(), 0);
        ring.present().unwrap();
        assert_eq!(ring.current_surface().index(), 1);
        ring.present().unwrap();
        assert_eq!(ring.current_surface().index(), 2);
        ring.present().unwrap();
        assert_eq!(ring.current_surface().index(), 0);
    }

    #[test]
    fn test_resize_resets_rotation() {
        let mut ring = ring(2);
        ring.present().unwrap();
        assert_eq!(ring.current_index(), 1);

        ring.resize(1024, 768).unwrap();
        assert_eq!(ring.current_index(), 0);
        assert_eq!(ring.extent(), Extent2d::new(1024, 768));
        assert_eq!(ring.current_surface().extent(), Extent2d::new(1024, 768));
    }

    #[test]
    fn test_stale_report_is_propagated() {
        let provider = NullSurfaceProvider::new(2).with_suboptimal_at(1);
        let mut ring = BackbufferRing::new(Box::new(provider), Extent2d::new(320, 240)).unwrap();
        assert!(!ring.present().unwrap());
        assert!(ring.present().unwrap());
        assert!(!ring.present().unwrap());
    }

    #[test]
    fn test_empty_surface_set_rejected() {
        let result = BackbufferRing::new(
            Box::new(NullSurfaceProvider::new(0)),
            Extent2d::new(800, 600),
        );
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }
}
