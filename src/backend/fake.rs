// Scripted GPU for tests
//
// Implements `GpuBackend` without a device. Every call is appended to a shared
// event log, and fence completion follows a test-selected policy so tests can
// observe exactly when the CPU side blocks.

use anyhow::{bail, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

use super::{
    Acquired, BufferUsage, ClearValues, DrawIndexed, Extent, GpuBackend, PresentMode, Presented,
    ShaderSet,
};

/// When signaled fence values become complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The GPU finishes the moment a value is signaled
    Immediate,
    /// Work finishes when the CPU blocks on it
    OnWait,
    /// Only `FakeGpuHandle::complete_up_to` advances the fences
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GpuEvent {
    FenceCreated(usize),
    FenceSignaled { fence: usize, value: u64 },
    /// The CPU had to block; not logged when the value was already complete
    FenceWaited { fence: usize, value: u64 },
    FenceDestroyed(usize),
    RecorderCreated(usize),
    RecorderReset(usize),
    Submitted { recorder: usize, image: Option<usize> },
    RecorderDestroyed(usize),
    BufferCreated { id: usize, size: u64, staging: bool },
    BufferCopied { src: usize, dst: usize, size: u64 },
    BufferDestroyed(usize),
    ImagesQueried { count: usize },
    /// `outstanding` is true if any fence had signaled-but-incomplete work
    ImageReleased { index: usize, outstanding: bool },
    ImageAcquired(usize),
    AcquireStale,
    Presented { image: usize, mode: PresentMode },
    SurfaceResized { extent: Extent, outstanding: bool },
    RenderTargetCreated(usize),
    RenderTargetDestroyed(usize),
    DepthCreated(Extent),
    DepthDestroyed(Extent),
    PipelineCreated,
    PipelineDestroyed,
    TransitionToTarget(usize),
    PassBegun { target: usize, extent: Extent },
    Draw { index_count: u32 },
    PassEnded,
    TransitionToPresent(usize),
}

#[derive(Debug, Default, Clone, Copy)]
struct Timeline {
    signaled: u64,
    completed: u64,
}

struct FenceState {
    mode: Completion,
    timelines: Vec<Timeline>,
}

impl FenceState {
    fn outstanding(&self) -> bool {
        self.timelines.iter().any(|t| t.signaled > t.completed)
    }
}

struct Shared {
    fences: Mutex<FenceState>,
    completed: Condvar,
    events: Mutex<Vec<GpuEvent>>,
}

impl Shared {
    fn log(&self, event: GpuEvent) {
        self.events.lock().push(event);
    }
}

/// Test-side view of a `FakeGpu` that has been moved into the engine.
#[derive(Clone)]
pub struct FakeGpuHandle {
    shared: Arc<Shared>,
}

impl FakeGpuHandle {
    pub fn events(&self) -> Vec<GpuEvent> {
        self.shared.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.shared.events.lock().clear();
    }

    pub fn count(&self, matches: impl Fn(&GpuEvent) -> bool) -> usize {
        self.shared.events.lock().iter().filter(|e| matches(e)).count()
    }

    /// Let the GPU finish everything up to `value` on `fence`.
    pub fn complete_up_to(&self, fence: usize, value: u64) {
        let mut state = self.shared.fences.lock();
        let timeline = &mut state.timelines[fence];
        timeline.completed = timeline.completed.max(value.min(timeline.signaled));
        self.shared.completed.notify_all();
    }

    pub fn completed(&self, fence: usize) -> u64 {
        self.shared.fences.lock().timelines[fence].completed
    }
}

#[derive(Debug)]
pub struct FakeRecorder {
    pub id: usize,
    open: bool,
}

#[derive(Debug)]
pub struct FakeBuffer {
    pub id: usize,
    pub size: u64,
}

#[derive(Debug)]
pub struct FakeImage {
    pub index: usize,
}

#[derive(Debug)]
pub struct FakeDepth {
    pub extent: Extent,
}

pub struct FakeGpu {
    shared: Arc<Shared>,
    next_id: usize,
    extent: Extent,
    image_count: usize,
    image_order: Vec<usize>,
    acquire_cursor: usize,
    tearing: bool,
    stale_presents: usize,
    stale_after: usize,
    stale_acquires: usize,
    acquires: usize,
    buffers_created: usize,
    failing_buffer: Option<usize>,
}

impl FakeGpu {
    pub fn new(extent: Extent, image_count: usize, mode: Completion) -> (Self, FakeGpuHandle) {
        let shared = Arc::new(Shared {
            fences: Mutex::new(FenceState {
                mode,
                timelines: Vec::new(),
            }),
            completed: Condvar::new(),
            events: Mutex::new(Vec::new()),
        });
        let gpu = Self {
            shared: shared.clone(),
            next_id: 0,
            extent,
            image_count,
            image_order: (0..image_count).collect(),
            acquire_cursor: 0,
            tearing: true,
            stale_presents: 0,
            stale_after: 0,
            stale_acquires: 0,
            acquires: 0,
            buffers_created: 0,
            failing_buffer: None,
        };
        (gpu, FakeGpuHandle { shared })
    }

    /// Hand out images in this order, cycling. Indices past the image count
    /// are handed out as given.
    pub fn with_image_order(mut self, order: Vec<usize>) -> Self {
        self.image_order = order;
        self
    }

    /// Report the next `count` presents as stale.
    pub fn with_stale_presents(mut self, count: usize) -> Self {
        self.stale_presents = count;
        self
    }

    /// After `after` acquires, report the next `count` as stale.
    pub fn with_stale_acquires(mut self, after: usize, count: usize) -> Self {
        self.stale_after = after;
        self.stale_acquires = count;
        self
    }

    /// Fail the `nth` buffer allocation (1-based, device and staging alike).
    pub fn with_failing_buffer(mut self, nth: usize) -> Self {
        self.failing_buffer = Some(nth);
        self
    }

    fn allocate_buffer(&mut self, size: u64, staging: bool) -> Result<FakeBuffer> {
        self.buffers_created += 1;
        if self.failing_buffer == Some(self.buffers_created) {
            bail!("out of device memory");
        }
        let id = self.id();
        self.shared.log(GpuEvent::BufferCreated { id, size, staging });
        Ok(FakeBuffer { id, size })
    }

    fn id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn outstanding(&self) -> bool {
        self.shared.fences.lock().outstanding()
    }
}

impl GpuBackend for FakeGpu {
    type Fence = usize;
    type Recorder = FakeRecorder;
    type Buffer = FakeBuffer;
    type Image = FakeImage;
    type RenderTarget = usize;
    type DepthBuffer = FakeDepth;
    type Pipeline = ();

    fn create_fence(&mut self) -> Result<usize> {
        let mut state = self.shared.fences.lock();
        state.timelines.push(Timeline::default());
        let fence = state.timelines.len() - 1;
        drop(state);
        self.shared.log(GpuEvent::FenceCreated(fence));
        Ok(fence)
    }

    fn signal_fence(&mut self, fence: &usize, value: u64) -> Result<()> {
        let mut state = self.shared.fences.lock();
        let mode = state.mode;
        let timeline = &mut state.timelines[*fence];
        if value <= timeline.signaled {
            bail!("fence {} signaled with {} after {}", fence, value, timeline.signaled);
        }
        timeline.signaled = value;
        if mode == Completion::Immediate {
            timeline.completed = value;
        }
        drop(state);
        self.shared.log(GpuEvent::FenceSignaled { fence: *fence, value });
        Ok(())
    }

    fn completed_value(&self, fence: &usize) -> Result<u64> {
        Ok(self.shared.fences.lock().timelines[*fence].completed)
    }

    fn wait_fence(&self, fence: &usize, value: u64, timeout: Option<Duration>) -> Result<bool> {
        self.shared.log(GpuEvent::FenceWaited { fence: *fence, value });
        let mut state = self.shared.fences.lock();
        if state.mode == Completion::OnWait {
            let timeline = &mut state.timelines[*fence];
            timeline.completed = timeline.completed.max(value.min(timeline.signaled));
        }
        loop {
            if state.timelines[*fence].completed >= value {
                return Ok(true);
            }
            match timeout {
                Some(timeout) => {
                    if self.shared.completed.wait_for(&mut state, timeout).timed_out() {
                        return Ok(state.timelines[*fence].completed >= value);
                    }
                }
                None => self.shared.completed.wait(&mut state),
            }
        }
    }

    fn destroy_fence(&mut self, fence: usize) {
        self.shared.log(GpuEvent::FenceDestroyed(fence));
    }

    fn create_recorder(&mut self) -> Result<FakeRecorder> {
        let id = self.id();
        self.shared.log(GpuEvent::RecorderCreated(id));
        Ok(FakeRecorder { id, open: false })
    }

    fn reset_recorder(&mut self, recorder: &mut FakeRecorder) -> Result<()> {
        recorder.open = true;
        self.shared.log(GpuEvent::RecorderReset(recorder.id));
        Ok(())
    }

    fn submit(&mut self, recorder: &mut FakeRecorder, present_image: Option<usize>) -> Result<()> {
        if !recorder.open {
            bail!("recorder {} submitted without being reset", recorder.id);
        }
        recorder.open = false;
        self.shared.log(GpuEvent::Submitted {
            recorder: recorder.id,
            image: present_image,
        });
        Ok(())
    }

    fn destroy_recorder(&mut self, recorder: FakeRecorder) {
        self.shared.log(GpuEvent::RecorderDestroyed(recorder.id));
    }

    fn create_device_buffer(&mut self, size: u64, _usage: BufferUsage) -> Result<FakeBuffer> {
        self.allocate_buffer(size, false)
    }

    fn create_staging_buffer(&mut self, contents: &[u8]) -> Result<FakeBuffer> {
        self.allocate_buffer(contents.len() as u64, true)
    }

    fn record_buffer_copy(
        &mut self,
        _recorder: &mut FakeRecorder,
        src: &FakeBuffer,
        dst: &FakeBuffer,
        size: u64,
    ) {
        self.shared.log(GpuEvent::BufferCopied {
            src: src.id,
            dst: dst.id,
            size,
        });
    }

    fn destroy_buffer(&mut self, buffer: FakeBuffer) {
        self.shared.log(GpuEvent::BufferDestroyed(buffer.id));
    }

    fn surface_extent(&self) -> Extent {
        self.extent
    }

    fn supports_tearing(&self) -> bool {
        self.tearing
    }

    fn surface_images(&mut self) -> Result<Vec<FakeImage>> {
        self.shared.log(GpuEvent::ImagesQueried {
            count: self.image_count,
        });
        Ok((0..self.image_count).map(|index| FakeImage { index }).collect())
    }

    fn release_image(&mut self, image: FakeImage) {
        let outstanding = self.outstanding();
        self.shared.log(GpuEvent::ImageReleased {
            index: image.index,
            outstanding,
        });
    }

    fn acquire_next_image(&mut self) -> Result<Acquired> {
        self.acquires += 1;
        if self.acquires > self.stale_after && self.stale_acquires > 0 {
            self.stale_acquires -= 1;
            self.shared.log(GpuEvent::AcquireStale);
            return Ok(Acquired::Stale);
        }
        let index = self.image_order[self.acquire_cursor % self.image_order.len()];
        self.acquire_cursor += 1;
        self.shared.log(GpuEvent::ImageAcquired(index));
        Ok(Acquired::Image(index))
    }

    fn present(&mut self, image_index: usize, mode: PresentMode) -> Result<Presented> {
        self.shared.log(GpuEvent::Presented {
            image: image_index,
            mode,
        });
        if self.stale_presents > 0 {
            self.stale_presents -= 1;
            return Ok(Presented::Stale);
        }
        Ok(Presented::Done)
    }

    fn resize_surface(&mut self, extent: Extent, _mode: PresentMode) -> Result<()> {
        let outstanding = self.outstanding();
        self.extent = extent;
        self.acquire_cursor = 0;
        self.shared.log(GpuEvent::SurfaceResized {
            extent,
            outstanding,
        });
        Ok(())
    }

    fn create_render_target(&mut self, image: &FakeImage) -> Result<usize> {
        self.shared.log(GpuEvent::RenderTargetCreated(image.index));
        Ok(image.index)
    }

    fn destroy_render_target(&mut self, target: usize) {
        self.shared.log(GpuEvent::RenderTargetDestroyed(target));
    }

    fn create_depth_buffer(&mut self, extent: Extent) -> Result<FakeDepth> {
        self.shared.log(GpuEvent::DepthCreated(extent));
        Ok(FakeDepth { extent })
    }

    fn destroy_depth_buffer(&mut self, depth: FakeDepth) {
        self.shared.log(GpuEvent::DepthDestroyed(depth.extent));
    }

    fn create_pipeline(&mut self, _shaders: &ShaderSet) -> Result<()> {
        self.shared.log(GpuEvent::PipelineCreated);
        Ok(())
    }

    fn destroy_pipeline(&mut self, _pipeline: ()) {
        self.shared.log(GpuEvent::PipelineDestroyed);
    }

    fn transition_to_render_target(
        &mut self,
        _recorder: &mut FakeRecorder,
        image: &FakeImage,
        _depth: &FakeDepth,
    ) {
        self.shared.log(GpuEvent::TransitionToTarget(image.index));
    }

    fn begin_pass(
        &mut self,
        _recorder: &mut FakeRecorder,
        target: &usize,
        _depth: &FakeDepth,
        extent: Extent,
        _clear: ClearValues,
    ) {
        self.shared.log(GpuEvent::PassBegun {
            target: *target,
            extent,
        });
    }

    fn draw_indexed(&mut self, _recorder: &mut FakeRecorder, draw: &DrawIndexed<'_, Self>) {
        self.shared.log(GpuEvent::Draw {
            index_count: draw.index_count,
        });
    }

    fn end_pass(&mut self, _recorder: &mut FakeRecorder) {
        self.shared.log(GpuEvent::PassEnded);
    }

    fn transition_to_present(&mut self, _recorder: &mut FakeRecorder, image: &FakeImage) {
        self.shared.log(GpuEvent::TransitionToPresent(image.index));
    }
}
