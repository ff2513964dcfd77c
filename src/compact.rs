use log::trace;

use crate::buffers::FrameBuffers;
use crate::context::{kernels, BufferAccess, BufferId, DeviceContext, DispatchRange, KernelArg};
use crate::error::{AllocationError, DispatchError};

/// Progress of one compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionPhase {
    Idle,
    /// Per-segment exclusive scan of the activity predicate.
    SegmentedScan,
    /// `count` divides evenly into segments; no remainder handling.
    Exact,
    /// Final segment partially filled; out-of-range lanes read the
    /// neutral element and never write past `count`.
    Boundary,
    /// Surviving rays move to their compacted positions.
    Scatter,
}

/// How `count` pending-ray slots split into scan segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanPartition {
    pub segment: usize,
    pub groups: usize,
    /// Dispatch width: `groups * segment` lanes, padded in the boundary case.
    pub padded: usize,
    pub exact: bool,
}

impl ScanPartition {
    pub fn for_count(count: usize, segment: usize) -> Self {
        let exact = count % segment == 0;
        let groups = if exact {
            count / segment
        } else {
            count / segment + 1
        };
        ScanPartition {
            segment,
            groups,
            padded: groups * segment,
            exact,
        }
    }
}

/// Exclusive prefix sum in place; returns the total.
fn exclusive_scan(values: &mut [i32]) -> i32 {
    let mut running = 0;
    for value in values.iter_mut() {
        let next = running + *value;
        *value = running;
        running = next;
    }
    running
}

#[derive(Debug)]
struct ScanScratch {
    scan: BufferId,
    totals: BufferId,
    bases: BufferId,
    capacity: usize,
    groups: usize,
}

impl ScanScratch {
    fn release<C: DeviceContext>(self, ctx: &mut C) {
        ctx.release_buffer(self.scan);
        ctx.release_buffer(self.totals);
        ctx.release_buffer(self.bases);
    }
}

/// Prefix-sum stream compaction of the per-pixel pending-ray list.
///
/// Rays terminate at different iteration counts; dense dispatch grids
/// waste throughput on inactive lanes. A pass scans the activity
/// predicate in segments sized to half the scan kernel's workgroup
/// maximum, combines the per-segment totals on the host into segment
/// bases, and scatters survivors into the inactive ping-pong slot in
/// their original relative order. Only a fully successful pass swaps the
/// buffer roles, so a failed pass falls back to uncompacted continuation
/// with the source buffers untouched.
///
/// The pass is a pure function of its inputs; the scratch buffers are a
/// capacity cache only.
#[derive(Debug)]
pub struct RayStreamCompactor {
    scratch: Option<ScanScratch>,
    phase: CompactionPhase,
}

impl RayStreamCompactor {
    pub fn new() -> Self {
        RayStreamCompactor {
            scratch: None,
            phase: CompactionPhase::Idle,
        }
    }

    pub fn phase(&self) -> CompactionPhase {
        self.phase
    }

    /// Run one compaction pass over the current ray stream and swap the
    /// ping-pong roles. Returns the number of surviving rays.
    pub fn compact<C: DeviceContext>(
        &mut self,
        ctx: &mut C,
        frame: &mut FrameBuffers,
    ) -> Result<u32, DispatchError> {
        let count = frame.pixel_count();
        let segment = (ctx.kernel_workgroup_size(kernels::PREFIX_SUM)? / 2).max(1);
        let partition = ScanPartition::for_count(count, segment);
        self.ensure_scratch(ctx, count, partition.groups)?;

        let outcome = self.run(ctx, frame, count, partition);
        self.phase = CompactionPhase::Idle;
        outcome
    }

    fn run<C: DeviceContext>(
        &mut self,
        ctx: &mut C,
        frame: &mut FrameBuffers,
        count: usize,
        partition: ScanPartition,
    ) -> Result<u32, DispatchError> {
        let scratch = self.scratch.as_ref().expect("scratch allocated");
        let (scan, totals, bases) = (scratch.scan, scratch.totals, scratch.bases);
        let segment = partition.segment;

        // The two divisibility cases differ purely in dispatch-range
        // construction; padded lanes read the neutral element.
        let range = if partition.exact {
            DispatchRange::linear(count, segment)
        } else {
            DispatchRange::linear(partition.padded, segment)
        };

        self.phase = CompactionPhase::SegmentedScan;
        ctx.dispatch(
            kernels::PREFIX_SUM,
            &range,
            &[
                KernelArg::Buffer(frame.ray_counts()),
                KernelArg::Buffer(scan),
                KernelArg::Buffer(totals),
                KernelArg::Local(2 * segment * 4),
                KernelArg::Int(segment as i32),
            ],
        )?;

        self.phase = if partition.exact {
            CompactionPhase::Exact
        } else {
            CompactionPhase::Boundary
        };
        let mut segment_totals = vec![0i32; partition.groups];
        ctx.read_buffer(totals, 0, bytemuck::cast_slice_mut(&mut segment_totals))?;
        let survivors = exclusive_scan(&mut segment_totals);
        ctx.write_buffer(bases, 0, bytemuck::cast_slice(&segment_totals))?;

        self.phase = CompactionPhase::Scatter;
        ctx.dispatch(
            kernels::SCATTER,
            &range,
            &[
                KernelArg::Buffer(frame.current_rays()),
                KernelArg::Buffer(frame.current_pixels()),
                KernelArg::Buffer(frame.ray_counts()),
                KernelArg::Buffer(scan),
                KernelArg::Buffer(bases),
                KernelArg::Buffer(frame.next_rays()),
                KernelArg::Buffer(frame.next_pixels()),
                KernelArg::Int(count as i32),
                KernelArg::Int(segment as i32),
            ],
        )?;

        frame.swap();
        trace!(
            "compacted {count} slots to {survivors} survivors ({} groups, {})",
            partition.groups,
            if partition.exact { "exact" } else { "boundary" }
        );
        Ok(survivors as u32)
    }

    fn ensure_scratch<C: DeviceContext>(
        &mut self,
        ctx: &mut C,
        count: usize,
        groups: usize,
    ) -> Result<(), AllocationError> {
        let fits = self
            .scratch
            .as_ref()
            .is_some_and(|s| s.capacity >= count && s.groups >= groups);
        if fits {
            return Ok(());
        }
        if let Some(old) = self.scratch.take() {
            old.release(ctx);
        }

        let scan = ctx.create_buffer(count * 4, BufferAccess::ReadWrite)?;
        let totals = match ctx.create_buffer(groups * 4, BufferAccess::ReadWrite) {
            Ok(id) => id,
            Err(err) => {
                ctx.release_buffer(scan);
                return Err(err);
            }
        };
        let bases = match ctx.create_buffer(groups * 4, BufferAccess::ReadWrite) {
            Ok(id) => id,
            Err(err) => {
                ctx.release_buffer(scan);
                ctx.release_buffer(totals);
                return Err(err);
            }
        };
        self.scratch = Some(ScanScratch {
            scan,
            totals,
            bases,
            capacity: count,
            groups,
        });
        Ok(())
    }

    pub fn release<C: DeviceContext>(&mut self, ctx: &mut C) {
        if let Some(scratch) = self.scratch.take() {
            scratch.release(ctx);
        }
    }
}

impl Default for RayStreamCompactor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::FakeContext;
    use crate::context::DeviceContext;
    use crate::buffers::{PIXEL_STRIDE, RAY_STRIDE};

    /// Context with the scan kernel reporting a 256-lane workgroup, so
    /// compaction segments are 128 slots wide.
    fn scan_context() -> FakeContext {
        let mut ctx = FakeContext::new();
        ctx.build_program("__kernels__").unwrap();
        for name in kernels::ALL {
            ctx.prepare_kernel(name).unwrap();
        }
        ctx
    }

    fn frame_of_width(ctx: &mut FakeContext, width: u32) -> FrameBuffers {
        FrameBuffers::allocate(ctx, width, 1).unwrap()
    }

    /// Tag every ray slot and pixel tag with its slot index.
    fn fill_slots(ctx: &mut FakeContext, frame: &FrameBuffers) {
        let count = frame.pixel_count();
        let mut rays = vec![0u32; count * RAY_STRIDE / 4];
        let mut pixels = vec![0i32; count * PIXEL_STRIDE / 4];
        for slot in 0..count {
            for word in 0..RAY_STRIDE / 4 {
                rays[slot * RAY_STRIDE / 4 + word] = slot as u32;
            }
            pixels[slot * 2] = slot as i32;
            pixels[slot * 2 + 1] = slot as i32 * 7;
        }
        ctx.write_buffer(frame.current_rays(), 0, bytemuck::cast_slice(&rays))
            .unwrap();
        ctx.write_buffer(frame.current_pixels(), 0, bytemuck::cast_slice(&pixels))
            .unwrap();
    }

    /// Slot indices recovered from a compacted ray buffer.
    fn survivor_slots(ctx: &FakeContext, rays: crate::context::BufferId, n: usize) -> Vec<u32> {
        let words: &[u32] = bytemuck::cast_slice(ctx.bytes(rays));
        (0..n).map(|k| words[k * RAY_STRIDE / 4]).collect()
    }

    #[test]
    fn partition_distinguishes_exact_and_boundary_cases() {
        let exact = ScanPartition::for_count(256, 128);
        assert_eq!(exact.groups, 2);
        assert_eq!(exact.padded, 256);
        assert!(exact.exact);

        let boundary = ScanPartition::for_count(300, 128);
        assert_eq!(boundary.groups, 3);
        assert_eq!(boundary.padded, 384);
        assert!(!boundary.exact);
    }

    #[test]
    fn exclusive_scan_returns_total_and_offsets() {
        let mut values = [3, 0, 2, 5];
        let total = exclusive_scan(&mut values);
        assert_eq!(total, 10);
        assert_eq!(values, [0, 3, 3, 5]);
    }

    #[test]
    fn compaction_packs_survivors_in_order_exact_case() {
        let mut ctx = scan_context();
        let mut frame = frame_of_width(&mut ctx, 256);
        fill_slots(&mut ctx, &frame);

        // 200 active of 256: every slot except those congruent 3 mod 4,
        // plus the first 36 of the excluded ones re-enabled.
        let mut counts = vec![0i32; 256];
        let mut expected = Vec::new();
        let mut active = 0;
        for (slot, count) in counts.iter_mut().enumerate() {
            if active < 200 && (slot % 4 != 3 || slot < 48) {
                *count = 1;
                active += 1;
            }
        }
        for (slot, count) in counts.iter().enumerate() {
            if *count > 0 {
                expected.push(slot as u32);
            }
        }
        assert_eq!(expected.len(), 200);
        ctx.write_i32s(frame.ray_counts(), &counts);

        let mut compactor = RayStreamCompactor::new();
        let survivors = compactor.compact(&mut ctx, &mut frame).unwrap();
        assert_eq!(survivors, 200);
        assert_eq!(frame.current_slot(), 1);
        assert_eq!(
            survivor_slots(&ctx, frame.current_rays(), 200),
            expected
        );
        assert_eq!(compactor.phase(), CompactionPhase::Idle);

        let scan_range = ctx.dispatches_of(kernels::PREFIX_SUM)[0].range;
        assert_eq!(scan_range.global_size[0], 256);
        assert_eq!(scan_range.local_size[0], 128);
    }

    #[test]
    fn compaction_handles_the_partially_filled_final_segment() {
        let mut ctx = scan_context();
        let mut frame = frame_of_width(&mut ctx, 300);
        fill_slots(&mut ctx, &frame);

        // 150 active of 300: every even slot.
        let counts: Vec<i32> = (0..300).map(|slot| (slot % 2 == 0) as i32).collect();
        ctx.write_i32s(frame.ray_counts(), &counts);

        let mut compactor = RayStreamCompactor::new();
        let survivors = compactor.compact(&mut ctx, &mut frame).unwrap();
        assert_eq!(survivors, 150);

        let expected: Vec<u32> = (0u32..300).filter(|slot| slot % 2 == 0).collect();
        assert_eq!(
            survivor_slots(&ctx, frame.current_rays(), 150),
            expected
        );

        // Boundary case pads the dispatch to a whole number of segments.
        let scan_range = ctx.dispatches_of(kernels::PREFIX_SUM)[0].range;
        assert_eq!(scan_range.global_size[0], 384);
    }

    #[test]
    fn compacting_an_all_active_set_is_byte_identical() {
        let mut ctx = scan_context();
        let mut frame = frame_of_width(&mut ctx, 256);
        fill_slots(&mut ctx, &frame);
        ctx.write_i32s(frame.ray_counts(), &vec![1i32; 256]);

        let rays_before = ctx.bytes(frame.current_rays()).to_vec();
        let pixels_before = ctx.bytes(frame.current_pixels()).to_vec();
        let counts_before = ctx.bytes(frame.ray_counts()).to_vec();

        let mut compactor = RayStreamCompactor::new();
        let survivors = compactor.compact(&mut ctx, &mut frame).unwrap();
        assert_eq!(survivors, 256);

        // Same triple, moved to the other slot.
        assert_eq!(frame.current_slot(), 1);
        assert_eq!(ctx.bytes(frame.current_rays()), rays_before.as_slice());
        assert_eq!(ctx.bytes(frame.current_pixels()), pixels_before.as_slice());
        assert_eq!(ctx.bytes(frame.ray_counts()), counts_before.as_slice());
    }

    #[test]
    fn failed_scatter_leaves_the_source_buffers_and_roles_untouched() {
        let mut ctx = scan_context();
        let mut frame = frame_of_width(&mut ctx, 256);
        fill_slots(&mut ctx, &frame);
        ctx.write_i32s(frame.ray_counts(), &vec![1i32; 256]);
        ctx.fail_dispatch_on = Some(kernels::SCATTER.to_owned());

        let rays_before = ctx.bytes(frame.current_rays()).to_vec();
        let mut compactor = RayStreamCompactor::new();
        let err = compactor.compact(&mut ctx, &mut frame).unwrap_err();
        assert!(matches!(err, DispatchError::Device { .. }));

        assert_eq!(frame.current_slot(), 0);
        assert_eq!(ctx.bytes(frame.current_rays()), rays_before.as_slice());
        assert_eq!(compactor.phase(), CompactionPhase::Idle);
    }

    #[test]
    fn scratch_is_reused_across_passes_of_the_same_size() {
        let mut ctx = scan_context();
        let mut frame = frame_of_width(&mut ctx, 256);
        fill_slots(&mut ctx, &frame);
        ctx.write_i32s(frame.ray_counts(), &vec![1i32; 256]);

        let mut compactor = RayStreamCompactor::new();
        compactor.compact(&mut ctx, &mut frame).unwrap();
        let after_first = ctx.alloc_count();
        compactor.compact(&mut ctx, &mut frame).unwrap();
        assert_eq!(ctx.alloc_count(), after_first);
    }
}
