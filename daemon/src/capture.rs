//! The capture adaptor: an abstraction over the underlying VBI device so the main
//! loop never has to know whether the real driver supports readiness selection.
//! Devices that can't be polled (the original daemon's `select()`-less raw devices)
//! are wrapped in a background thread that blocks on the real read and wakes the
//! main loop through a channel instead of the pipe-byte trick the C daemon uses —
//! `mpsc::Receiver` already gives us a readiness-like signal without hand-rolling one.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::thread::JoinHandle;
use vbiproto::message::SlicedIndication;
use vbiproto::{ErrorUtils, ProtoError, ProtoResult, Services};

bitflags::bitflags! {
    /// What a concrete capture back-end is able to do, queried once at open time and
    /// used to decide whether the reader-thread shim is needed.
    pub struct Capabilities: u32 {
        /// The device file descriptor can be registered with the event loop directly.
        const SELECTABLE = 0x01;
        const RAW_SAMPLES = 0x02;
        const SLICED_SAMPLES = 0x04;
    }
}

/// A source of VBI frames. A `mio`-selectable device implements this directly and is
/// registered with the main loop's `Poll`; a non-selectable device is wrapped in
/// [`ThreadedCaptureSource`], which implements it by draining a channel instead.
pub trait CaptureSource: Send {
    fn capabilities(&self) -> Capabilities;

    fn set_services(&mut self, services: Services) -> ProtoResult<Services>;

    /// Non-blocking: returns `Err(ProtoError::Wait)` when no frame is ready yet.
    fn try_read(&mut self) -> ProtoResult<SlicedIndication>;
}

/// Wraps a blocking capture source in a background thread, bridging it to the
/// non-blocking `try_read` every other source type exposes.
pub struct ThreadedCaptureSource {
    rx: Receiver<ProtoResult<SlicedIndication>>,
    _handle: JoinHandle<()>,
    capabilities: Capabilities,
}

impl ThreadedCaptureSource {
    pub fn spawn<F>(capabilities: Capabilities, mut blocking_read: F) -> ThreadedCaptureSource
    where
        F: FnMut() -> ProtoResult<SlicedIndication> + Send + 'static,
    {
        let (tx, rx): (Sender<ProtoResult<SlicedIndication>>, _) = mpsc::channel();
        let handle = thread::spawn(move || loop {
            let result = blocking_read();
            let failed = result.has_failed();
            if tx.send(result).is_err() {
                return;
            }
            if failed {
                return;
            }
        });
        ThreadedCaptureSource {
            rx,
            _handle: handle,
            capabilities,
        }
    }
}

impl CaptureSource for ThreadedCaptureSource {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn set_services(&mut self, services: Services) -> ProtoResult<Services> {
        Ok(services)
    }

    fn try_read(&mut self) -> ProtoResult<SlicedIndication> {
        match self.rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => Err(ProtoError::Wait),
            Err(TryRecvError::Disconnected) => {
                Err(ProtoError::Fatal(vbiproto::ErrorKind::Io(std::io::ErrorKind::BrokenPipe)))
            }
        }
    }
}

/// A deterministic, in-process stand-in for a real device, used by integration tests
/// to drive the scheduler and client sessions without hardware.
pub struct SimCaptureSource {
    granted: Services,
    queue: std::collections::VecDeque<SlicedIndication>,
}

impl SimCaptureSource {
    pub fn new() -> SimCaptureSource {
        SimCaptureSource {
            granted: Services::empty(),
            queue: std::collections::VecDeque::new(),
        }
    }

    pub fn push_frame(&mut self, frame: SlicedIndication) {
        self.queue.push_back(frame);
    }
}

impl Default for SimCaptureSource {
    fn default() -> SimCaptureSource {
        SimCaptureSource::new()
    }
}

impl CaptureSource for SimCaptureSource {
    fn capabilities(&self) -> Capabilities {
        Capabilities::SELECTABLE | Capabilities::SLICED_SAMPLES | Capabilities::RAW_SAMPLES
    }

    fn set_services(&mut self, services: Services) -> ProtoResult<Services> {
        self.granted = services;
        Ok(services)
    }

    fn try_read(&mut self) -> ProtoResult<SlicedIndication> {
        self.queue.pop_front().ok_or(ProtoError::Wait)
    }
}
