//! Device (component K, spec §4.K): output format, mixing-period
//! scheduling and the backend callback contract, plus the device clock,
//! latency estimate and the owning buffer registry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use sonus_core::{Buffer, ChannelLayout, Id, Registry, SonusResult};
use sonus_engine::{Context, PostProcess, Source};
use sonus_spatial::{AmbisonicOrder, HrtfDataset};

use crate::backend::{Backend, CpalBackend, PeriodCallback};
use crate::error::{DeviceError, DeviceResult};
use crate::event::{Event, EventThread};

/// Requested device configuration for `open`/`reset` (spec §4.K, §11
/// Configuration). Mirrors the teacher's `AudioConfig`.
#[derive(Clone)]
pub struct DeviceAttributes {
    pub sample_rate: u32,
    pub output_channels: ChannelLayout,
    pub period_frames: usize,
    pub max_voices: usize,
    pub hrtf: Option<Arc<HrtfDataset>>,
    pub ambisonic_order: AmbisonicOrder,
}

impl Default for DeviceAttributes {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            output_channels: ChannelLayout::Stereo,
            period_frames: 512,
            max_voices: sonus_engine::DEFAULT_MAX_VOICES,
            hrtf: None,
            ambisonic_order: AmbisonicOrder::First,
        }
    }
}

fn build_post_process(attrs: &DeviceAttributes, period_frames: usize) -> PostProcess {
    match &attrs.hrtf {
        Some(dataset) => {
            PostProcess::Hrtf(Box::new(sonus_engine::HrtfRenderer::new(dataset, attrs.ambisonic_order, period_frames)))
        }
        None if attrs.output_channels.is_ambisonic() => {
            let speakers = Vec::new();
            PostProcess::Ambisonic {
                order: attrs.ambisonic_order,
                decoder: sonus_spatial::AmbisonicDecoder::new(attrs.ambisonic_order, &speakers),
            }
        }
        None => PostProcess::DirectStereo,
    }
}

/// A device clock: a monotonic sample counter advanced once per mixing
/// period (spec §5 ordering guarantee iv), plus a last-observed latency
/// estimate in samples.
#[derive(Default)]
pub struct DeviceClock {
    samples: AtomicU64,
    latency_samples: AtomicU64,
}

impl DeviceClock {
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn latency_samples(&self) -> u64 {
        self.latency_samples.load(Ordering::Relaxed)
    }

    fn advance(&self, frame_count: u64) {
        self.samples.fetch_add(frame_count, Ordering::Relaxed);
    }

    fn set_latency(&self, latency: u64) {
        self.latency_samples.store(latency, Ordering::Relaxed);
    }
}

/// Device (spec §4.K). Owns the buffer registry and a `cpal`-backed
/// stream; drives one [`Context::mix`] call per hardware period.
pub struct Device {
    backend: Box<dyn Backend>,
    buffers: Arc<Registry<Buffer>>,
    /// Shared with `Context` so source creation/play/pause/stop/rewind and
    /// buffer-queue edits never need the mixer's own `Arc<Mutex<Context>>`
    /// (spec §5: "mixer thread takes no locks owned by application
    /// threads"). `context()` stays around for the rarer structural calls
    /// (listener, effect-slot graph, post-process config) that do need it.
    sources: Arc<Registry<Arc<Source>>>,
    context: Arc<Mutex<Context>>,
    clock: Arc<DeviceClock>,
    connected: Arc<AtomicBool>,
    error_latch: Arc<Mutex<Option<DeviceError>>>,
    events: Option<Arc<sonus_core::SpscRing<Event>>>,
    event_thread: Option<EventThread>,
    attrs: DeviceAttributes,
    open: bool,
}

impl Device {
    /// `open(spec) → device | error` (spec §4.K).
    pub fn open(attrs: DeviceAttributes) -> DeviceResult<Self> {
        Self::open_with_backend(attrs, Box::new(CpalBackend::new()), None)
    }

    /// `open`, but installing an event callback up front (spec §6 "Event
    /// callback").
    pub fn open_with_events(
        attrs: DeviceAttributes,
        event_callback: crate::event::EventCallback,
    ) -> DeviceResult<Self> {
        Self::open_with_backend(attrs, Box::new(CpalBackend::new()), Some(event_callback))
    }

    fn open_with_backend(
        attrs: DeviceAttributes,
        mut backend: Box<dyn Backend>,
        event_callback: Option<crate::event::EventCallback>,
    ) -> DeviceResult<Self> {
        let buffers: Arc<Registry<Buffer>> = Arc::new(Registry::new());
        let sources: Arc<Registry<Arc<Source>>> = Arc::new(Registry::new());
        let post = build_post_process(&attrs, attrs.period_frames);
        let context = Arc::new(Mutex::new(Context::new(
            buffers.clone(),
            sources.clone(),
            attrs.sample_rate as f64,
            attrs.output_channels.channel_count(),
            post,
            attrs.max_voices.max(1),
        )));

        let clock = Arc::new(DeviceClock::default());
        let connected = Arc::new(AtomicBool::new(true));
        let error_latch: Arc<Mutex<Option<DeviceError>>> = Arc::new(Mutex::new(None));

        let (event_thread, events) = match event_callback {
            Some(cb) => {
                let (thread, ring) = EventThread::spawn(256, cb);
                (Some(thread), Some(ring))
            }
            None => (None, None),
        };

        let callback_context = Arc::clone(&context);
        let callback_clock = Arc::clone(&clock);
        let callback_events = events.clone();
        let period_frames = attrs.period_frames;
        let period_callback: PeriodCallback = Box::new(move |output, frame_count| {
            // The mixer thread: no allocation beyond what `mix` itself
            // performs, no application locks (spec §5). `period_frames`
            // is the contract the backend was opened with; a mismatch
            // here means the backend ignored the fixed buffer-size hint.
            let frame_count = frame_count.min(period_frames);
            let mut ctx = callback_context.lock();
            let channels = ctx.output_channels();
            let retired = ctx.mix(&mut output[..frame_count * channels], frame_count);
            drop(ctx);
            callback_clock.advance(frame_count as u64);
            if let Some(ring) = &callback_events {
                if !retired.is_empty() {
                    let events: Vec<Event> =
                        retired.iter().map(|&id| Event::source_state_changed(id, 0)).collect();
                    ring.push(&events);
                }
            }
        });

        let on_error = make_error_sink(Arc::clone(&connected), Arc::clone(&error_latch), events.clone());
        backend.open(
            attrs.sample_rate,
            attrs.output_channels.channel_count() as u16,
            attrs.period_frames,
            period_callback,
            on_error,
        )?;
        backend.start()?;
        clock.set_latency(backend.reported_latency_frames() as u64 + attrs.period_frames as u64);

        Ok(Self {
            backend,
            buffers,
            sources,
            context,
            clock,
            connected,
            error_latch,
            events,
            event_thread,
            attrs,
            open: true,
        })
    }

    pub fn buffers(&self) -> &Arc<Registry<Buffer>> {
        &self.buffers
    }

    /// Reach the context's listener, effect-slot graph and post-process
    /// config. Rare, setup-time structural calls only — per-source
    /// operations (`create_source`, `play`, `queue_buffers`, ...) have
    /// their own `Device` methods below that never take this lock.
    pub fn context(&self) -> &Arc<Mutex<Context>> {
        &self.context
    }

    /// `genSource` (spec §4.G): never contends with the mixer callback's
    /// `Arc<Mutex<Context>>` lock.
    pub fn create_source(&self) -> Id {
        self.sources.insert(Arc::new(Source::new(self.buffers.clone())))
    }

    pub fn source(&self, id: Id) -> Option<Arc<Source>> {
        self.sources.with(id, |s| s.clone())
    }

    /// `deleteSource` (spec §4.G): fails if the source is Playing or Paused.
    pub fn delete_source(&self, id: Id) -> SonusResult<()> {
        let can_delete = self.sources.with(id, |s| s.can_delete());
        match can_delete {
            Some(true) => {
                self.sources.remove(id);
                Ok(())
            }
            Some(false) => Err(sonus_core::SonusError::InvalidOperation("source is Playing or Paused".into())),
            None => Err(sonus_core::SonusError::InvalidName(format!("no such source: {id:?}"))),
        }
    }

    /// `play`/`pause`/`stop`/`rewind` (spec §4.F): the source's own state
    /// machine is self-contained, so these go straight to the `Source`
    /// without taking `context`'s lock. The mixer picks up a Playing
    /// source's voice on its next period (see `Context::mix`).
    pub fn play(&self, id: Id) -> SonusResult<()> {
        self.with_source(id, |s| s.play())
    }

    pub fn pause_source(&self, id: Id) -> SonusResult<()> {
        self.with_source(id, |s| s.pause())
    }

    pub fn stop_source(&self, id: Id) -> SonusResult<()> {
        self.with_source(id, |s| s.stop())
    }

    pub fn rewind(&self, id: Id) -> SonusResult<()> {
        self.with_source(id, |s| s.rewind())
    }

    /// `queueBuffers`/`unqueueBuffers` (spec §4.G).
    pub fn queue_buffers(&self, id: Id, buffer_ids: &[Id]) -> SonusResult<()> {
        self.with_source(id, |s| s.queue_buffers(buffer_ids))
    }

    pub fn unqueue_buffers(&self, id: Id, count: usize) -> SonusResult<Vec<Id>> {
        self.with_source(id, |s| s.unqueue_buffers(count))
    }

    fn with_source<R>(&self, id: Id, f: impl FnOnce(&Source) -> SonusResult<R>) -> SonusResult<R> {
        match self.sources.with(id, |s| s.clone()) {
            Some(source) => f(&source),
            None => Err(sonus_core::SonusError::InvalidName(format!("no such source: {id:?}"))),
        }
    }

    /// Device clock: monotonic sample counter (spec §4.K, §5).
    pub fn clock(&self) -> &DeviceClock {
        &self.clock
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// `pause` (spec §4.K).
    pub fn pause(&mut self) -> DeviceResult<()> {
        self.require_open()?;
        self.backend.pause()
    }

    /// `resume` (spec §4.K). Named `resume` rather than `start` to match
    /// the spec's device operation name; the stream was already built and
    /// started on `open`.
    pub fn resume(&mut self) -> DeviceResult<()> {
        self.require_open()?;
        self.backend.start()
    }

    /// `close` (spec §4.K, §5: "closing a device drains the mixer").
    pub fn close(&mut self) {
        self.backend.close();
        self.open = false;
        self.event_thread = None;
    }

    /// `reset(new_attributes) → ok | error` (spec §4.K): re-opens the
    /// backend stream and swaps the context's post-process stage in
    /// place, preserving sources, buffers and listener state.
    pub fn reset(&mut self, new_attrs: DeviceAttributes) -> DeviceResult<()> {
        self.backend.close();
        let post = build_post_process(&new_attrs, new_attrs.period_frames);
        {
            let mut ctx = self.context.lock();
            ctx.set_post(post);
            ctx.set_output_channels(new_attrs.output_channels.channel_count());
        }

        let callback_context = Arc::clone(&self.context);
        let callback_clock = Arc::clone(&self.clock);
        let callback_events = self.events.clone();
        let period_frames = new_attrs.period_frames;
        let period_callback: PeriodCallback = Box::new(move |output, frame_count| {
            let frame_count = frame_count.min(period_frames);
            let mut ctx = callback_context.lock();
            let channels = ctx.output_channels();
            let retired = ctx.mix(&mut output[..frame_count * channels], frame_count);
            drop(ctx);
            callback_clock.advance(frame_count as u64);
            if let Some(ring) = &callback_events {
                if !retired.is_empty() {
                    let events: Vec<Event> =
                        retired.iter().map(|&id| Event::source_state_changed(id, 0)).collect();
                    ring.push(&events);
                }
            }
        });

        let on_error = make_error_sink(Arc::clone(&self.connected), Arc::clone(&self.error_latch), self.events.clone());
        self.backend.open(
            new_attrs.sample_rate,
            new_attrs.output_channels.channel_count() as u16,
            new_attrs.period_frames,
            period_callback,
            on_error,
        )?;
        self.backend.start()?;
        self.clock.set_latency(self.backend.reported_latency_frames() as u64 + new_attrs.period_frames as u64);
        self.attrs = new_attrs;
        self.open = true;
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// `flush_errors` (spec §4.K, §7: "getError returns one code and
    /// clears it"). Returns and clears the device-level error latch.
    pub fn flush_errors(&self) -> Option<DeviceError> {
        self.error_latch.lock().take()
    }

    pub fn attributes(&self) -> &DeviceAttributes {
        &self.attrs
    }

    /// Spec §7: once the connected flag drops, calls that would otherwise
    /// touch the backend return `InvalidOperation`-equivalent errors.
    fn require_open(&self) -> DeviceResult<()> {
        if !self.open {
            Err(DeviceError::NotOpen)
        } else if !self.is_connected() {
            Err(DeviceError::Disconnected)
        } else {
            Ok(())
        }
    }
}

/// Builds the backend's error sink: on a fatal stream error, clears the
/// connected flag, latches the error for `flush_errors`, and — if an event
/// thread is installed — delivers one `Disconnected` event (spec §7, §6).
fn make_error_sink(
    connected: Arc<AtomicBool>,
    error_latch: Arc<Mutex<Option<DeviceError>>>,
    events: Option<Arc<sonus_core::SpscRing<Event>>>,
) -> crate::backend::ErrorSink {
    Box::new(move |message| {
        connected.store(false, Ordering::Release);
        *error_latch.lock() = Some(DeviceError::StreamError(message));
        if let Some(ring) = &events {
            ring.push(&[Event::disconnected("backend stream error")]);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeBackend {
        period_frames: usize,
        started: Arc<AtomicBool>,
        paused_count: Arc<AtomicUsize>,
    }

    impl Backend for FakeBackend {
        fn open(
            &mut self,
            _sample_rate: u32,
            _channels: u16,
            period_frames: usize,
            mut callback: PeriodCallback,
            _on_error: crate::backend::ErrorSink,
        ) -> DeviceResult<()> {
            self.period_frames = period_frames;
            let mut buf = vec![0.0f32; period_frames * 2];
            callback(&mut buf, period_frames);
            Ok(())
        }

        fn start(&mut self) -> DeviceResult<()> {
            self.started.store(true, Ordering::Relaxed);
            Ok(())
        }

        fn pause(&mut self) -> DeviceResult<()> {
            self.paused_count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn close(&mut self) {
            self.started.store(false, Ordering::Relaxed);
        }

        fn reported_latency_frames(&self) -> usize {
            64
        }
    }

    #[test]
    fn open_advances_the_device_clock_by_one_period() {
        let started = Arc::new(AtomicBool::new(false));
        let paused_count = Arc::new(AtomicUsize::new(0));
        let backend = Box::new(FakeBackend { period_frames: 0, started: started.clone(), paused_count });
        let attrs = DeviceAttributes { period_frames: 128, ..Default::default() };
        let device = Device::open_with_backend(attrs, backend, None).unwrap();
        assert!(started.load(Ordering::Relaxed));
        assert_eq!(device.clock().samples(), 128);
        assert_eq!(device.clock().latency_samples(), 64 + 128);
    }

    #[test]
    fn pause_requires_an_open_device() {
        let started = Arc::new(AtomicBool::new(false));
        let paused_count = Arc::new(AtomicUsize::new(0));
        let backend = Box::new(FakeBackend { period_frames: 0, started, paused_count: paused_count.clone() });
        let attrs = DeviceAttributes::default();
        let mut device = Device::open_with_backend(attrs, backend, None).unwrap();
        device.pause().unwrap();
        assert_eq!(paused_count.load(Ordering::Relaxed), 1);
        device.close();
        assert!(device.pause().is_err());
    }
}
