// SPDX-License-Identifier: CEPL-1.0
//! Frame-slot state machine driving acquire -> submit -> present.
//!
//! The scheduler owns no GPU objects. A [`FrameBackend`] performs each step and
//! reports fence and surface state back; the scheduler decides ordering,
//! slot rotation, and when the presentation lifecycle must be recreated.
//!
//! Each slot cycles `Waiting -> Acquiring -> Submitted -> Presenting` and stays
//! in `Presenting` until the scheduler comes back to it and waits on its fence.
use anyhow::{ensure, Result};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotPhase {
    Waiting,
    Acquiring,
    Submitted,
    Presenting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    /// An image was acquired and the slot's acquire semaphore will signal.
    Image { index: usize, suboptimal: bool },
    /// The surface no longer matches; nothing was acquired.
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawOutcome {
    Presented,
    /// The presentation lifecycle was rebuilt during this call.
    Recreated,
    /// Framebuffer extent is zero; nothing was done.
    Paused,
    /// The slot fence did not signal within the timeout; nothing was acquired.
    Skipped,
}

/// GPU-side operations the scheduler sequences.
pub trait FrameBackend {
    fn image_count(&self) -> usize;
    fn extent_is_zero(&self) -> bool;
    /// Bounded wait on the slot's completion fence.
    fn wait_slot(&mut self, slot: usize) -> Result<FenceWait>;
    fn acquire(&mut self, slot: usize) -> Result<Acquire>;
    fn reset_slot(&mut self, slot: usize) -> Result<()>;
    fn write_uniforms(&mut self, image: usize) -> Result<()>;
    /// Submit the command buffer recorded for `image`, waiting on the slot's
    /// acquire semaphore and arming the slot's fence.
    fn submit(&mut self, slot: usize, image: usize) -> Result<()>;
    fn present(&mut self, image: usize) -> Result<PresentStatus>;
    /// Drain the device, then destroy and create the presentation lifecycle.
    fn recreate(&mut self) -> Result<()>;
}

#[derive(Debug)]
pub struct FrameScheduler {
    slot: usize,
    phases: Vec<SlotPhase>,
    /// Slot that last submitted each presentable image.
    image_owner: Vec<Option<usize>>,
    stale: bool,
    recreations: u64,
}

impl FrameScheduler {
    pub fn new(slots: usize, image_count: usize) -> Self {
        Self {
            slot: 0,
            phases: vec![SlotPhase::Waiting; slots.max(1)],
            image_owner: vec![None; image_count],
            stale: false,
            recreations: 0,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.phases.len()
    }

    /// Active frame slot.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn phase(&self, slot: usize) -> SlotPhase {
        self.phases[slot]
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn recreations(&self) -> u64 {
        self.recreations
    }

    /// Force a lifecycle recreation on the next non-paused `draw`.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn draw<B: FrameBackend + ?Sized>(&mut self, backend: &mut B) -> Result<DrawOutcome> {
        if backend.extent_is_zero() {
            return Ok(DrawOutcome::Paused);
        }
        if self.stale {
            self.recreate(backend, "surface marked stale")?;
            return Ok(DrawOutcome::Recreated);
        }

        let slot = self.slot;
        self.phases[slot] = SlotPhase::Waiting;
        if backend.wait_slot(slot)? == FenceWait::TimedOut {
            warn!(slot, "frame fence did not signal in time, skipping frame");
            return Ok(DrawOutcome::Skipped);
        }

        self.phases[slot] = SlotPhase::Acquiring;
        let (image, suboptimal) = match backend.acquire(slot)? {
            Acquire::Image { index, suboptimal } => (index, suboptimal),
            Acquire::Stale => {
                self.phases[slot] = SlotPhase::Waiting;
                self.recreate(backend, "acquire reported out of date")?;
                return Ok(DrawOutcome::Recreated);
            }
        };
        ensure!(
            image < self.image_owner.len(),
            "acquired image {image} out of range ({} images)",
            self.image_owner.len()
        );

        // The image may still be in flight from another slot when image count != N.
        if let Some(owner) = self.image_owner[image] {
            if owner != slot {
                wait_signaled(backend, owner)?;
            }
        }

        backend.reset_slot(slot)?;
        backend.write_uniforms(image)?;
        backend.submit(slot, image)?;
        self.image_owner[image] = Some(slot);
        self.phases[slot] = SlotPhase::Submitted;

        let status = backend.present(image)?;
        self.phases[slot] = SlotPhase::Presenting;
        self.slot = (slot + 1) % self.phases.len();

        if suboptimal || status == PresentStatus::Stale {
            let reason = if suboptimal {
                "acquire reported suboptimal"
            } else {
                "present reported stale"
            };
            self.recreate(backend, reason)?;
            return Ok(DrawOutcome::Recreated);
        }
        Ok(DrawOutcome::Presented)
    }

    fn recreate<B: FrameBackend + ?Sized>(&mut self, backend: &mut B, reason: &str) -> Result<()> {
        debug!(reason, "recreating presentation");
        backend.recreate()?;
        self.image_owner = vec![None; backend.image_count()];
        self.phases.fill(SlotPhase::Waiting);
        self.stale = false;
        self.recreations += 1;
        Ok(())
    }
}

fn wait_signaled<B: FrameBackend + ?Sized>(backend: &mut B, slot: usize) -> Result<()> {
    // An image is already acquired, so the frame cannot be abandoned here.
    let mut retries = 0u32;
    while backend.wait_slot(slot)? == FenceWait::TimedOut {
        if retries == 0 {
            warn!(slot, "still waiting for in-flight image");
        }
        retries += 1;
    }
    if retries > 0 {
        debug!(slot, retries, "in-flight image released");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::collections::{HashSet, VecDeque};

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Reset(usize),
        Write(usize),
        Submit(usize, usize),
        Present(usize),
        Recreate,
    }

    /// Scripted backend. GPU work finishes the moment its fence is waited on,
    /// and every fence/ordering rule is asserted at the call site.
    struct MockBackend {
        images: usize,
        zero: bool,
        next_image: usize,
        generation: usize,
        waits: VecDeque<FenceWait>,
        acquires: VecDeque<Acquire>,
        presents: VecDeque<PresentStatus>,
        lose_device_on_present: bool,
        pending: Vec<bool>,
        image_slot: Vec<Option<usize>>,
        executed: Vec<(usize, usize)>,
        calls: Vec<Call>,
    }

    impl MockBackend {
        fn new(slots: usize, images: usize) -> Self {
            Self {
                images,
                zero: false,
                next_image: 0,
                generation: 0,
                waits: VecDeque::new(),
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                lose_device_on_present: false,
                pending: vec![false; slots],
                image_slot: vec![None; images],
                executed: Vec::new(),
                calls: Vec::new(),
            }
        }

        fn command_buffer(&self, image: usize) -> usize {
            self.generation * 100 + image
        }

        fn recreates(&self) -> usize {
            self.calls.iter().filter(|c| **c == Call::Recreate).count()
        }

        fn submits(&self) -> usize {
            self.calls.iter().filter(|c| matches!(c, Call::Submit(..))).count()
        }
    }

    impl FrameBackend for MockBackend {
        fn image_count(&self) -> usize {
            self.images
        }

        fn extent_is_zero(&self) -> bool {
            self.zero
        }

        fn wait_slot(&mut self, slot: usize) -> Result<FenceWait> {
            self.calls.push(Call::Wait(slot));
            if let Some(FenceWait::TimedOut) = self.waits.pop_front() {
                return Ok(FenceWait::TimedOut);
            }
            self.pending[slot] = false;
            Ok(FenceWait::Signaled)
        }

        fn acquire(&mut self, slot: usize) -> Result<Acquire> {
            self.calls.push(Call::Acquire(slot));
            if let Some(scripted) = self.acquires.pop_front() {
                return Ok(scripted);
            }
            let index = self.next_image % self.images;
            self.next_image += 1;
            Ok(Acquire::Image { index, suboptimal: false })
        }

        fn reset_slot(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Reset(slot));
            assert!(!self.pending[slot], "slot {slot} fence reset while work pending");
            Ok(())
        }

        fn write_uniforms(&mut self, image: usize) -> Result<()> {
            self.calls.push(Call::Write(image));
            if let Some(prev) = self.image_slot[image] {
                assert!(!self.pending[prev], "uniforms of image {image} written while in flight");
            }
            Ok(())
        }

        fn submit(&mut self, slot: usize, image: usize) -> Result<()> {
            self.calls.push(Call::Submit(slot, image));
            assert!(!self.pending[slot], "slot {slot} resubmitted before its fence signaled");
            if let Some(prev) = self.image_slot[image] {
                assert!(!self.pending[prev], "image {image} resubmitted while in flight");
            }
            self.pending[slot] = true;
            self.image_slot[image] = Some(slot);
            self.executed.push((image, self.command_buffer(image)));
            Ok(())
        }

        fn present(&mut self, image: usize) -> Result<PresentStatus> {
            self.calls.push(Call::Present(image));
            if self.lose_device_on_present {
                bail!("device lost");
            }
            Ok(self.presents.pop_front().unwrap_or(PresentStatus::Presented))
        }

        fn recreate(&mut self) -> Result<()> {
            self.calls.push(Call::Recreate);
            self.pending.fill(false);
            self.image_slot = vec![None; self.images];
            self.generation += 1;
            Ok(())
        }
    }

    #[test]
    fn one_draw_runs_the_full_cycle_in_order() {
        let mut backend = MockBackend::new(3, 3);
        let mut sched = FrameScheduler::new(3, 3);
        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Presented);
        assert_eq!(
            backend.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Reset(0),
                Call::Write(0),
                Call::Submit(0, 0),
                Call::Present(0),
            ]
        );
        assert_eq!(sched.phase(0), SlotPhase::Presenting);
        assert_eq!(sched.phase(1), SlotPhase::Waiting);
        assert_eq!(sched.slot(), 1);
    }

    #[test]
    fn slot_index_cycles_through_n_values() {
        let mut backend = MockBackend::new(3, 3);
        let mut sched = FrameScheduler::new(3, 3);
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(sched.slot());
            assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Presented);
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 3);
    }

    #[test]
    fn fewer_images_than_slots_never_overlap() {
        let mut backend = MockBackend::new(3, 2);
        let mut sched = FrameScheduler::new(3, 2);
        for _ in 0..20 {
            sched.draw(&mut backend).unwrap();
        }
        assert_eq!(backend.submits(), 20);
    }

    #[test]
    fn more_images_than_slots_never_overlap() {
        let mut backend = MockBackend::new(2, 4);
        let mut sched = FrameScheduler::new(2, 4);
        for _ in 0..20 {
            sched.draw(&mut backend).unwrap();
        }
        assert_eq!(backend.submits(), 20);
    }

    #[test]
    fn each_image_executes_its_own_command_buffer() {
        let mut backend = MockBackend::new(3, 3);
        let mut sched = FrameScheduler::new(3, 3);
        for _ in 0..12 {
            sched.draw(&mut backend).unwrap();
        }
        assert_eq!(backend.executed.len(), 12);
        for &(image, cmd) in &backend.executed {
            assert_eq!(cmd, image);
        }
    }

    #[test]
    fn stale_acquire_recreates_once_and_resumes() {
        let mut backend = MockBackend::new(3, 3);
        backend.acquires.push_back(Acquire::Stale);
        let mut sched = FrameScheduler::new(3, 3);

        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Recreated);
        assert_eq!(backend.recreates(), 1);
        assert_eq!(backend.submits(), 0);
        assert_eq!(sched.slot(), 0);

        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Presented);
        assert_eq!(backend.recreates(), 1);
        assert_eq!(sched.recreations(), 1);
        // Buffers recorded after the rebuild are the ones executed.
        assert_eq!(backend.executed, vec![(0, 100)]);
    }

    #[test]
    fn suboptimal_acquire_finishes_frame_then_recreates() {
        let mut backend = MockBackend::new(3, 3);
        backend.acquires.push_back(Acquire::Image { index: 1, suboptimal: true });
        let mut sched = FrameScheduler::new(3, 3);

        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Recreated);
        assert_eq!(backend.submits(), 1);
        assert_eq!(backend.recreates(), 1);
        assert_eq!(backend.calls.last(), Some(&Call::Recreate));
        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Presented);
        assert_eq!(backend.recreates(), 1);
    }

    #[test]
    fn stale_present_recreates_after_advancing() {
        let mut backend = MockBackend::new(3, 3);
        backend.presents.push_back(PresentStatus::Stale);
        let mut sched = FrameScheduler::new(3, 3);

        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Recreated);
        assert_eq!(sched.slot(), 1);
        assert_eq!(backend.recreates(), 1);
        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Presented);
    }

    #[test]
    fn marked_stale_recreates_before_acquiring() {
        let mut backend = MockBackend::new(3, 3);
        let mut sched = FrameScheduler::new(3, 3);
        sched.mark_stale();

        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Recreated);
        assert_eq!(backend.calls, vec![Call::Recreate]);
        assert!(!sched.is_stale());
        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Presented);
    }

    #[test]
    fn zero_extent_pauses_and_defers_recreation() {
        let mut backend = MockBackend::new(3, 3);
        backend.zero = true;
        let mut sched = FrameScheduler::new(3, 3);
        sched.mark_stale();

        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Paused);
        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Paused);
        assert!(backend.calls.is_empty());
        assert!(sched.is_stale());

        backend.zero = false;
        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Recreated);
        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Presented);
    }

    #[test]
    fn fence_timeout_skips_without_acquiring() {
        let mut backend = MockBackend::new(3, 3);
        backend.waits.push_back(FenceWait::TimedOut);
        let mut sched = FrameScheduler::new(3, 3);

        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Skipped);
        assert_eq!(backend.calls, vec![Call::Wait(0)]);
        assert_eq!(sched.slot(), 0);
        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Presented);
    }

    #[test]
    fn failed_present_leaves_slot_submitted() {
        let mut backend = MockBackend::new(3, 3);
        backend.lose_device_on_present = true;
        let mut sched = FrameScheduler::new(3, 3);

        assert!(sched.draw(&mut backend).is_err());
        assert_eq!(sched.phase(0), SlotPhase::Submitted);
        assert_eq!(sched.slot(), 0);
    }

    #[test]
    fn in_flight_image_wait_outlasts_timeouts() {
        // One image, two slots: the second draw must wait on slot 0's fence.
        let mut backend = MockBackend::new(2, 1);
        backend.waits.extend([
            FenceWait::Signaled,
            FenceWait::Signaled,
            FenceWait::TimedOut,
            FenceWait::TimedOut,
        ]);
        let mut sched = FrameScheduler::new(2, 1);

        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Presented);
        assert_eq!(sched.draw(&mut backend).unwrap(), DrawOutcome::Presented);
        let owner_waits = backend.calls.iter().filter(|c| **c == Call::Wait(0)).count();
        assert_eq!(owner_waits, 4);
        assert_eq!(backend.submits(), 2);
    }

    #[test]
    fn out_of_range_image_is_an_error() {
        let mut backend = MockBackend::new(2, 2);
        backend.acquires.push_back(Acquire::Image { index: 5, suboptimal: false });
        let mut sched = FrameScheduler::new(2, 2);
        assert!(sched.draw(&mut backend).is_err());
    }
}
