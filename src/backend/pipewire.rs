//! PipeWire backend: duplex capture/playback streams on the PipeWire
//! main-loop thread.
//!
//! The playback stream's process callback drives the user callback;
//! captured input accumulates from the capture stream running on the same
//! loop. `NODE_LATENCY` requests a quantum equal to the configured buffer,
//! and the callback is always invoked with exactly that many frames even
//! if the server hands us a different cycle size.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use pipewire::{
    self as pw,
    context::ContextRc,
    main_loop::MainLoopRc,
    spa::{self, utils::Direction},
    stream::{Stream, StreamFlags, StreamRc, StreamState},
};
use pw::properties::properties;

use super::{AudioBackend, ProcessCallback};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::CHANNELS;

/// Message asking the loop thread to wind down.
struct Terminate;

/// State shared between the two stream callbacks; single-threaded (both
/// run on the loop thread), hence Rc/RefCell.
struct Duplex {
    callback: ProcessCallback,
    frames: usize,
    /// Captured mono samples not yet consumed by a callback invocation.
    pending_in: VecDeque<f32>,
    /// Interleaved stereo output awaiting the playback stream.
    out_queue: VecDeque<f32>,
    input_scratch: Vec<f32>,
    out_left: Vec<f32>,
    out_right: Vec<f32>,
    /// Callback invocations that ran on silence because capture fell behind.
    shortfalls: Arc<AtomicU64>,
}

impl Duplex {
    fn new(frames: usize, callback: ProcessCallback, shortfalls: Arc<AtomicU64>) -> Self {
        Self {
            callback,
            frames,
            pending_in: VecDeque::with_capacity(frames * 8),
            out_queue: VecDeque::with_capacity(frames * CHANNELS * 8),
            input_scratch: vec![0.0; frames],
            out_left: vec![0.0; frames],
            out_right: vec![0.0; frames],
            shortfalls,
        }
    }

    /// One strictly-sequential invocation of the user callback.
    fn run_callback(&mut self) {
        let frames = self.frames;
        if self.pending_in.len() >= frames {
            for slot in self.input_scratch.iter_mut() {
                *slot = self.pending_in.pop_front().unwrap_or(0.0);
            }
        } else {
            self.input_scratch.fill(0.0);
            self.shortfalls.fetch_add(1, Ordering::Relaxed);
        }

        (self.callback)(&self.input_scratch, &mut self.out_left, &mut self.out_right);

        for i in 0..frames {
            self.out_queue.push_back(self.out_left[i]);
            self.out_queue.push_back(self.out_right[i]);
        }
    }
}

struct DuplexHandle {
    shared: Rc<RefCell<Duplex>>,
}

pub struct PipewireBackend {
    running: Arc<AtomicBool>,
    xruns: Arc<AtomicU64>,
    callback: Option<ProcessCallback>,
    thread: Option<JoinHandle<Option<ProcessCallback>>>,
    stop_tx: Option<pw::channel::Sender<Terminate>>,
    frames: usize,
    rate: u32,
    latency_ms: f64,
}

impl PipewireBackend {
    pub fn new(config: &SessionConfig, callback: ProcessCallback) -> Result<Self> {
        Ok(Self {
            running: Arc::new(AtomicBool::new(false)),
            xruns: Arc::new(AtomicU64::new(0)),
            callback: Some(callback),
            thread: None,
            stop_tx: None,
            frames: config.buffer_size,
            rate: config.sample_rate,
            latency_ms: config.buffer_size as f64 / config.sample_rate as f64 * 1000.0,
        })
    }
}

impl AudioBackend for PipewireBackend {
    fn start(&mut self) -> Result<()> {
        let callback = self.callback.take().ok_or(Error::AlreadyRunning)?;
        let (stop_tx, stop_rx) = pw::channel::channel();

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let xruns = self.xruns.clone();
        let frames = self.frames;
        let rate = self.rate;

        let handle = thread::Builder::new()
            .name("pwar-pw".into())
            .spawn(move || {
                let recovered = run_loop(frames, rate, callback, xruns, stop_rx);
                running.store(false, Ordering::SeqCst);
                recovered
            })
            .map_err(|e| Error::Backend(format!("pipewire thread spawn: {e}")))?;

        self.thread = Some(handle);
        self.stop_tx = Some(stop_tx);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(Terminate);
        }
        if let Some(handle) = self.thread.take() {
            match handle.join() {
                Ok(callback) => self.callback = callback,
                Err(_) => return Err(Error::Backend("pipewire thread panicked".into())),
            }
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn latency_ms(&self) -> f64 {
        self.latency_ms
    }

    fn xruns(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }
}

impl Drop for PipewireBackend {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Everything PipeWire happens on this thread. Returns the process
/// callback so the backend can be started again after a stop.
fn run_loop(
    frames: usize,
    rate: u32,
    callback: ProcessCallback,
    xruns: Arc<AtomicU64>,
    stop_rx: pw::channel::Receiver<Terminate>,
) -> Option<ProcessCallback> {
    let shared = Rc::new(RefCell::new(Duplex::new(frames, callback, xruns)));

    let result = (|| -> std::result::Result<(), String> {
        pw::init();
        let main_loop = MainLoopRc::new(None).map_err(|e| e.to_string())?;
        let context = ContextRc::new(&main_loop, None).map_err(|e| e.to_string())?;
        let core = context.connect_rc(None).map_err(|e| e.to_string())?;

        let loop_for_quit = main_loop.clone();
        let _stop_guard = stop_rx.attach(main_loop.loop_(), move |_| {
            loop_for_quit.quit();
        });

        let quantum = format!("{frames}/{rate}");

        let capture = StreamRc::new(
            core.clone(),
            "pwar-capture",
            properties! {
                *pw::keys::MEDIA_TYPE => "Audio",
                *pw::keys::MEDIA_CATEGORY => "Capture",
                *pw::keys::MEDIA_ROLE => "Production",
                *pw::keys::NODE_LATENCY => quantum.as_str(),
            },
        )
        .map_err(|e| e.to_string())?;

        let _cap_listener = capture
            .add_local_listener_with_user_data(DuplexHandle {
                shared: shared.clone(),
            })
            .process(on_capture)
            .state_changed(|_, _, _, new| {
                if let StreamState::Error(e) = new {
                    log::error!("capture stream error: {e}");
                }
            })
            .register()
            .map_err(|e| e.to_string())?;

        let cap_format = audio_format_pod(1, rate, &[libspa_sys::SPA_AUDIO_CHANNEL_MONO])?;
        let mut cap_params = [spa::pod::Pod::from_bytes(&cap_format)
            .ok_or_else(|| "capture format pod rejected".to_string())?];
        capture
            .connect(
                Direction::Input,
                None,
                StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS | StreamFlags::RT_PROCESS,
                &mut cap_params,
            )
            .map_err(|e| e.to_string())?;

        let playback = StreamRc::new(
            core,
            "pwar-playback",
            properties! {
                *pw::keys::MEDIA_TYPE => "Audio",
                *pw::keys::MEDIA_CATEGORY => "Playback",
                *pw::keys::MEDIA_ROLE => "Production",
                *pw::keys::NODE_LATENCY => quantum.as_str(),
            },
        )
        .map_err(|e| e.to_string())?;

        let _pb_listener = playback
            .add_local_listener_with_user_data(DuplexHandle {
                shared: shared.clone(),
            })
            .process(on_playback)
            .state_changed(|_, _, _, new| {
                if let StreamState::Error(e) = new {
                    log::error!("playback stream error: {e}");
                }
            })
            .register()
            .map_err(|e| e.to_string())?;

        let pb_format = audio_format_pod(
            CHANNELS as u32,
            rate,
            &[
                libspa_sys::SPA_AUDIO_CHANNEL_FL,
                libspa_sys::SPA_AUDIO_CHANNEL_FR,
            ],
        )?;
        let mut pb_params = [spa::pod::Pod::from_bytes(&pb_format)
            .ok_or_else(|| "playback format pod rejected".to_string())?];
        playback
            .connect(
                Direction::Output,
                None,
                StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS | StreamFlags::RT_PROCESS,
                &mut pb_params,
            )
            .map_err(|e| e.to_string())?;

        main_loop.run();
        Ok(())
    })();

    if let Err(e) = result {
        log::error!("pipewire loop: {e}");
    }

    // Listeners and streams are gone; the last Rc yields the callback back.
    Rc::try_unwrap(shared)
        .ok()
        .map(|cell| cell.into_inner().callback)
}

fn on_capture(stream: &Stream, state: &mut DuplexHandle) {
    let Some(mut buffer) = stream.dequeue_buffer() else {
        return;
    };
    let datas = buffer.datas_mut();
    if datas.is_empty() {
        return;
    }
    let n_bytes = datas[0].chunk().size() as usize;
    let Some(slice) = datas[0].data() else {
        return;
    };
    let n_bytes = n_bytes.min(slice.len());

    let mut shared = state.shared.borrow_mut();
    for raw in slice[..n_bytes].chunks_exact(4) {
        let mut b = [0u8; 4];
        b.copy_from_slice(raw);
        shared.pending_in.push_back(f32::from_ne_bytes(b));
    }
    // Bound the backlog so a stalled playback stream cannot grow it forever.
    let cap = shared.frames * 8;
    while shared.pending_in.len() > cap {
        shared.pending_in.pop_front();
    }
}

fn on_playback(stream: &Stream, state: &mut DuplexHandle) {
    let Some(mut buffer) = stream.dequeue_buffer() else {
        return;
    };
    let stride = CHANNELS * std::mem::size_of::<f32>();

    let n_frames = if let Some(slice) = buffer.datas_mut()[0].data() {
        let n_frames = slice.len() / stride;
        let mut shared = state.shared.borrow_mut();

        let needed = n_frames * CHANNELS;
        while shared.out_queue.len() < needed {
            shared.run_callback();
        }
        for i in 0..needed {
            let v = shared.out_queue.pop_front().unwrap_or(0.0);
            slice[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes());
        }
        n_frames
    } else {
        0
    };

    let chunk = buffer.datas_mut()[0].chunk_mut();
    *chunk.offset_mut() = 0;
    *chunk.stride_mut() = stride as _;
    *chunk.size_mut() = (stride * n_frames) as _;
}

fn audio_format_pod(
    channels: u32,
    rate: u32,
    positions: &[u32],
) -> std::result::Result<Vec<u8>, String> {
    use spa::param::audio;

    let mut info = audio::AudioInfoRaw::new();
    info.set_format(audio::AudioFormat::F32LE);
    info.set_rate(rate);
    info.set_channels(channels);
    let mut position = [0; audio::MAX_CHANNELS];
    for (i, &p) in positions.iter().enumerate() {
        position[i] = p;
    }
    info.set_position(position);

    let (cursor, _) = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(spa::pod::Object {
            type_: libspa_sys::SPA_TYPE_OBJECT_Format,
            id: libspa_sys::SPA_PARAM_EnumFormat,
            properties: info.into(),
        }),
    )
    .map_err(|e| format!("format pod serialize: {e:?}"))?;

    Ok(cursor.into_inner())
}
