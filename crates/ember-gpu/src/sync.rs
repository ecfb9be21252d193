//! Per-frame synchronization.
//!
//! A [`FrameSyncSet`] owns one image-available semaphore, one render-finished
//! semaphore and one fence per in-flight slot. Fences start signaled so the
//! first wait on every slot returns immediately.

use crate::error::{GpuError, Result};
use ash::vk;

/// The device calls the frame protocol needs.
///
/// Implemented for [`ash::Device`]; tests substitute a recorder.
pub trait SyncPrimitives {
    /// Create a binary semaphore.
    ///
    /// # Safety
    /// The device must be valid.
    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore>;

    /// Create a fence, optionally already signaled.
    ///
    /// # Safety
    /// The device must be valid.
    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;

    /// Block until `fence` signals, then reset it.
    ///
    /// # Safety
    /// The device and fence must be valid.
    unsafe fn wait_and_reset_fence(&self, fence: vk::Fence) -> Result<()>;

    /// # Safety
    /// The semaphore must not be in use.
    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// # Safety
    /// The fence must not be in use.
    unsafe fn destroy_fence(&self, fence: vk::Fence);
}

impl SyncPrimitives for ash::Device {
    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        Ok(ash::Device::create_semaphore(self, &create_info, None)?)
    }

    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(ash::Device::create_fence(self, &create_info, None)?)
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    unsafe fn wait_and_reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.wait_for_fences(&[fence], true, u64::MAX)?;
        self.reset_fences(&[fence])?;
        Ok(())
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        ash::Device::destroy_semaphore(self, semaphore, None);
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        ash::Device::destroy_fence(self, fence, None);
    }
}

/// Handles for the slot the current frame runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    /// Ring index in `0..N`.
    pub index: usize,
    /// Signaled by image acquisition; waited on by the frame's submit.
    pub image_available: vk::Semaphore,
    /// Signaled by the frame's submit; waited on by present.
    pub render_finished: vk::Semaphore,
    /// Pass to the frame's final submit.
    pub in_flight: vk::Fence,
}

/// Bounded ring of in-flight frame slots.
pub struct FrameSyncSet {
    image_available: Vec<vk::Semaphore>,
    render_finished: Vec<vk::Semaphore>,
    fences: Vec<vk::Fence>,
    counter: u64,
    current: usize,
    frame_open: bool,
}

impl FrameSyncSet {
    /// Create `frames_in_flight` slots. At least one is required.
    ///
    /// On failure everything created so far is destroyed again.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new<D: SyncPrimitives + ?Sized>(device: &D, frames_in_flight: usize) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(GpuError::InvalidConfig(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }

        let mut set = Self {
            image_available: Vec::with_capacity(frames_in_flight),
            render_finished: Vec::with_capacity(frames_in_flight),
            fences: Vec::with_capacity(frames_in_flight),
            counter: 0,
            current: 0,
            frame_open: false,
        };

        if let Err(e) = set.populate(device, frames_in_flight) {
            set.destroy(device);
            return Err(e);
        }

        tracing::debug!("Created frame sync set with {} slots", frames_in_flight);
        Ok(set)
    }

    unsafe fn populate<D: SyncPrimitives + ?Sized>(&mut self, device: &D, frames: usize) -> Result<()> {
        for _ in 0..frames {
            self.image_available.push(device.create_semaphore()?);
            self.render_finished.push(device.create_semaphore()?);
            self.fences.push(device.create_fence(true)?);
        }
        Ok(())
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }

    /// Frames begun so far.
    pub fn frame_counter(&self) -> u64 {
        self.counter
    }

    /// Advance to the next slot and wait for its previous frame to retire.
    ///
    /// The wait is unbounded; a fence that never signals hangs here.
    ///
    /// # Safety
    /// The device must be the one the set was created on.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn begin_frame<D: SyncPrimitives + ?Sized>(&mut self, device: &D) -> Result<FrameSlot> {
        if self.frame_open {
            tracing::warn!(
                "begin_frame called without end_frame for frame {}",
                self.counter
            );
        }

        if self.is_empty() {
            return Err(GpuError::InvalidState(
                "frame sync set has been destroyed".to_string(),
            ));
        }

        self.counter += 1;
        self.current = (self.counter % self.len() as u64) as usize;

        device.wait_and_reset_fence(self.fences[self.current])?;
        self.frame_open = true;

        Ok(self.current())
    }

    /// Close the current frame. Fences are signaled by the caller's submit.
    pub fn end_frame(&mut self) {
        self.frame_open = false;
    }

    /// Handles of the current slot.
    pub fn current(&self) -> FrameSlot {
        FrameSlot {
            index: self.current,
            image_available: self.image_available[self.current],
            render_finished: self.render_finished[self.current],
            in_flight: self.fences[self.current],
        }
    }

    /// Destroy fences, then render-finished, then image-available semaphores.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy<D: SyncPrimitives + ?Sized>(&mut self, device: &D) {
        for fence in self.fences.drain(..) {
            device.destroy_fence(fence);
        }
        for semaphore in self.render_finished.drain(..) {
            device.destroy_semaphore(semaphore);
        }
        for semaphore in self.image_available.drain(..) {
            device.destroy_semaphore(semaphore);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::{Cell, RefCell};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        CreateSemaphore(u64),
        CreateFence { raw: u64, signaled: bool },
        WaitAndReset(u64),
        DestroySemaphore(u64),
        DestroyFence(u64),
    }

    #[derive(Default)]
    struct Recorder {
        next: Cell<u64>,
        calls: RefCell<Vec<Call>>,
        fail_after: Option<u64>,
    }

    impl Recorder {
        fn failing_after(handles: u64) -> Self {
            Self {
                fail_after: Some(handles),
                ..Default::default()
            }
        }

        fn allocate(&self) -> Result<u64> {
            let raw = self.next.get() + 1;
            if self.fail_after.is_some_and(|limit| raw > limit) {
                return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
            }
            self.next.set(raw);
            Ok(raw)
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.borrow().clone()
        }
    }

    impl SyncPrimitives for Recorder {
        unsafe fn create_semaphore(&self) -> Result<vk::Semaphore> {
            let raw = self.allocate()?;
            self.calls.borrow_mut().push(Call::CreateSemaphore(raw));
            Ok(vk::Semaphore::from_raw(raw))
        }

        unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
            let raw = self.allocate()?;
            self.calls.borrow_mut().push(Call::CreateFence { raw, signaled });
            Ok(vk::Fence::from_raw(raw))
        }

        unsafe fn wait_and_reset_fence(&self, fence: vk::Fence) -> Result<()> {
            self.calls.borrow_mut().push(Call::WaitAndReset(fence.as_raw()));
            Ok(())
        }

        unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
            self.calls
                .borrow_mut()
                .push(Call::DestroySemaphore(semaphore.as_raw()));
        }

        unsafe fn destroy_fence(&self, fence: vk::Fence) {
            self.calls.borrow_mut().push(Call::DestroyFence(fence.as_raw()));
        }
    }

    #[test]
    fn zero_slots_are_rejected() {
        let recorder = Recorder::default();
        let result = unsafe { FrameSyncSet::new(&recorder, 0) };

        assert!(matches!(result, Err(GpuError::InvalidConfig(_))));
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn begin_after_destroy_fails_instead_of_panicking() {
        let recorder = Recorder::default();
        let mut set = unsafe { FrameSyncSet::new(&recorder, 2) }.unwrap();
        unsafe { set.destroy(&recorder) };

        let result = unsafe { set.begin_frame(&recorder) };
        assert!(matches!(result, Err(GpuError::InvalidState(_))));
        assert_eq!(set.frame_counter(), 0);
    }

    #[test]
    fn creates_signaled_fences_and_two_semaphores_per_slot() {
        for n in 1..=4 {
            let recorder = Recorder::default();
            let set = unsafe { FrameSyncSet::new(&recorder, n) }.unwrap();
            assert_eq!(set.len(), n);

            let calls = recorder.calls();
            let fences: Vec<_> = calls
                .iter()
                .filter_map(|c| match c {
                    Call::CreateFence { signaled, .. } => Some(*signaled),
                    _ => None,
                })
                .collect();
            let semaphores = calls
                .iter()
                .filter(|c| matches!(c, Call::CreateSemaphore(_)))
                .count();

            assert_eq!(fences.len(), n);
            assert!(fences.iter().all(|signaled| *signaled));
            assert_eq!(semaphores, 2 * n);
        }
    }

    #[test]
    fn two_n_frames_visit_every_slot_twice() {
        let recorder = Recorder::default();
        let n = 3;
        let mut set = unsafe { FrameSyncSet::new(&recorder, n) }.unwrap();
        let fences: Vec<vk::Fence> = (0..n).map(|i| set.fences[i]).collect();

        let mut visits = vec![0; n];
        for _ in 0..2 * n {
            let slot = unsafe { set.begin_frame(&recorder) }.unwrap();
            assert_eq!(slot.in_flight, fences[slot.index]);
            visits[slot.index] += 1;
            set.end_frame();
        }

        assert_eq!(visits, vec![2; n]);
        assert_eq!(set.frame_counter(), 2 * n as u64);

        let waits: Vec<u64> = recorder
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::WaitAndReset(raw) => Some(raw),
                _ => None,
            })
            .collect();
        assert_eq!(waits.len(), 2 * n);
        for fence in &fences {
            assert_eq!(waits.iter().filter(|raw| **raw == fence.as_raw()).count(), 2);
        }
    }

    #[test]
    fn single_slot_always_reuses_slot_zero() {
        let recorder = Recorder::default();
        let mut set = unsafe { FrameSyncSet::new(&recorder, 1) }.unwrap();

        for _ in 0..3 {
            let slot = unsafe { set.begin_frame(&recorder) }.unwrap();
            assert_eq!(slot.index, 0);
            set.end_frame();
        }
    }

    #[test]
    fn current_matches_the_slot_begin_frame_returned() {
        let recorder = Recorder::default();
        let mut set = unsafe { FrameSyncSet::new(&recorder, 2) }.unwrap();

        let slot = unsafe { set.begin_frame(&recorder) }.unwrap();
        assert_eq!(set.current(), slot);
        assert_ne!(slot.image_available, slot.render_finished);
    }

    #[test]
    fn destroy_order_is_fences_then_render_finished_then_image_available() {
        let recorder = Recorder::default();
        let mut set = unsafe { FrameSyncSet::new(&recorder, 2) }.unwrap();
        let render_finished = set.render_finished.clone();
        let image_available = set.image_available.clone();
        let fences = set.fences.clone();

        recorder.calls.borrow_mut().clear();
        unsafe { set.destroy(&recorder) };

        let mut expected: Vec<Call> = fences.iter().map(|f| Call::DestroyFence(f.as_raw())).collect();
        expected.extend(render_finished.iter().map(|s| Call::DestroySemaphore(s.as_raw())));
        expected.extend(image_available.iter().map(|s| Call::DestroySemaphore(s.as_raw())));
        assert_eq!(recorder.calls(), expected);
        assert!(set.is_empty());
    }

    #[test]
    fn partial_creation_is_rolled_back() {
        // Slot 0 gets three handles; the first handle of slot 1 fails.
        let recorder = Recorder::failing_after(3);
        let result = unsafe { FrameSyncSet::new(&recorder, 2) };
        assert!(matches!(result, Err(GpuError::Vulkan(_))));

        let calls = recorder.calls();
        let destroyed = calls
            .iter()
            .filter(|c| matches!(c, Call::DestroyFence(_) | Call::DestroySemaphore(_)))
            .count();
        assert_eq!(destroyed, 3);
    }
}
