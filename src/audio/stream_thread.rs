//! PipeWire plumbing shared by the microphone and the output device
//!
//! Every stream runs its own PipeWire main loop on a dedicated thread. The
//! thread reports back once the stream is connected and quits on `Stop`.

use crate::error::{CallError, CallResult};
use log::error;
use pipewire as pw;
use pw::spa;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;

/// How long a stream may take to connect
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) enum StreamCommand {
    Stop,
}

/// Taken by the stream thread once the stream is connected
pub(crate) type ReadySender = Option<oneshot::Sender<CallResult<()>>>;

/// Main loop, context and core of one stream thread
pub(crate) struct Graph {
    pub core: pw::core::CoreRc,
    _context: pw::context::ContextRc,
    pub mainloop: pw::main_loop::MainLoopRc,
}

impl Graph {
    pub fn connect() -> Result<Self, String> {
        pw::init();

        let mainloop = pw::main_loop::MainLoopRc::new(None)
            .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;

        let context = pw::context::ContextRc::new(&mainloop, None)
            .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;

        let core = context
            .connect_rc(None)
            .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

        Ok(Self {
            core,
            _context: context,
            mainloop,
        })
    }

    /// Run the main loop until `Stop` arrives on `receiver`
    pub fn run_until_stopped(&self, receiver: pw::channel::Receiver<StreamCommand>) {
        let mainloop_weak = self.mainloop.downgrade();
        let _receiver = receiver.attach(self.mainloop.loop_(), move |cmd| match cmd {
            StreamCommand::Stop => {
                if let Some(mainloop) = mainloop_weak.upgrade() {
                    mainloop.quit();
                }
            }
        });

        self.mainloop.run();
    }
}

/// Serialized `EnumFormat` param asking for mono F32LE at `rate`
pub(crate) fn mono_f32_format(rate: u32) -> Result<Vec<u8>, String> {
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(rate);
    audio_info.set_channels(1);

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    Ok(spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("Failed to serialize audio format: {:?}", e))?
    .0
    .into_inner())
}

/// Owner of one stream thread
pub(crate) struct StreamThread {
    name: &'static str,
    is_running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    sender: Option<pw::channel::Sender<StreamCommand>>,
}

impl StreamThread {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            is_running: Arc::new(AtomicBool::new(false)),
            handle: None,
            sender: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Run `body` on a new thread and wait until it reports the stream
    /// connected. Errors are wrapped with `fail`.
    pub async fn start<F>(&mut self, fail: fn(String) -> CallError, body: F) -> CallResult<()>
    where
        F: FnOnce(pw::channel::Receiver<StreamCommand>, &mut ReadySender) -> Result<(), String>
            + Send
            + 'static,
    {
        let name = self.name;
        if self.is_running() {
            return Err(fail(format!("{} already running", name)));
        }
        self.is_running.store(true, Ordering::SeqCst);

        let is_running = self.is_running.clone();
        let (sender, receiver) = pw::channel::channel::<StreamCommand>();
        let (ready_tx, ready_rx) = oneshot::channel();
        self.sender = Some(sender);

        let handle = thread::spawn(move || {
            let mut ready = Some(ready_tx);
            if let Err(e) = body(receiver, &mut ready) {
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(fail(e)));
                    }
                    None => error!("{} error: {}", name, e),
                }
            }
            is_running.store(false, Ordering::SeqCst);
        });
        self.handle = Some(handle);

        match tokio::time::timeout(CONNECT_TIMEOUT, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(fail(format!(
                "{} thread exited before the stream connected",
                name
            ))),
            Err(_) => Err(fail(format!(
                "Timed out connecting the {} stream",
                name.to_lowercase()
            ))),
        }
    }

    /// Quit the main loop and join the thread. Safe to call when stopped.
    pub fn stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(StreamCommand::Stop);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.is_running.store(false, Ordering::SeqCst);
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}
