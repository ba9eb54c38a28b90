//! entrypoint of the presentation loop
//!
//! [`Strobe`] owns the device and its outputs, everything runs on one
//! thread driven by a calloop [`EventLoop`]:
//!
//! - the device descriptor delivers page-flip completions, each one
//!   triggers the next frame of the output it belongs to
//! - a timer and, optionally, console input end the run
//! - after every wake-up, idle outputs are redrawn, which is how a
//!   rejected frame gets retried
//!
//! once the loop ends, [`Strobe::shutdown`] waits for outstanding flips
//! before releasing anything
use std::{os::fd::AsFd, time::Instant};

use anyhow::{Context, Result};
use calloop::{
    generic::Generic,
    timer::{TimeoutAction, Timer},
    EventLoop, Interest, Mode, PostAction,
};
use kms_device::{FlipEvent, KmsDevice};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    backend,
    config::Config,
    error::ErrorKind,
    state::Outputs,
    utils::drm_scanner::{DrmScanner, SimpleCrtcMapper},
    Error,
};

pub struct Strobe<D: KmsDevice> {
    pub device: D,
    pub outputs: Outputs<D::Mapping>,
    pub config: Config,
    pub running: bool,
    rng: StdRng,
    /// first error that ended the run early
    fatal: Option<Error>,
}

/// open the configured device and present frames until the run ends
pub fn run(config: Config) -> Result<()> {
    let device = backend::open(&config.device)?;
    backend::negotiate(&device).context("failed to negotiate device capabilities")?;

    let mut event_loop = EventLoop::try_new().context("failed to setup event loop")?;
    let mut strobe = Strobe::setup(&mut event_loop, device, config, StdRng::from_os_rng())?;
    strobe.run(&mut event_loop)
}

impl<D> Strobe<D>
where
    D: KmsDevice + 'static,
{
    /// discover outputs, validate their combined configuration, register
    /// the loop sources and submit the first frames
    pub fn setup(
        event_loop: &mut EventLoop<'static, Self>,
        device: D,
        config: Config,
        mut rng: StdRng,
    ) -> Result<Self> {
        let mut scanner = DrmScanner::<SimpleCrtcMapper>::new();
        let mut outputs = Outputs::discover(&device, &mut scanner, &mut rng)?;

        if let Err(err) = outputs.validate(&device) {
            outputs.release(&device);
            return Err(err.into());
        }

        let mut strobe = Strobe {
            device,
            outputs,
            config,
            running: true,
            rng,
            fatal: None,
        };

        if let Err(err) = strobe.register_sources(event_loop) {
            strobe.outputs.release(&strobe.device);
            return Err(err);
        }

        strobe.refresh();
        Ok(strobe)
    }

    fn register_sources(&mut self, event_loop: &mut EventLoop<'static, Self>) -> Result<()> {
        let handle = event_loop.handle();

        let fd = self
            .device
            .as_fd()
            .try_clone_to_owned()
            .context("failed to duplicate device fd")?;
        handle
            .insert_source(Generic::new(fd, Interest::READ, Mode::Level), |_, _, strobe| {
                strobe.dispatch();
                Ok(PostAction::Continue)
            })
            .map_err(|err| anyhow::anyhow!("failed to watch device events: {}", err.error))?;

        handle
            .insert_source(Timer::from_duration(self.config.duration), |_, _, strobe| {
                tracing::info!("run time elapsed");
                strobe.running = false;
                TimeoutAction::Drop
            })
            .map_err(|err| anyhow::anyhow!("failed to setup deadline: {}", err.error))?;

        if self.config.watch_stdin {
            let stdin = Generic::new(std::io::stdin(), Interest::READ, Mode::Level);
            let inserted = handle.insert_source(stdin, |_, _, strobe| {
                tracing::info!("exit due to user-input");
                strobe.running = false;
                Ok(PostAction::Remove)
            });
            if let Err(err) = inserted {
                tracing::warn!("not watching console input: {}", err.error);
            }
        }

        Ok(())
    }

    pub fn run(&mut self, event_loop: &mut EventLoop<'static, Self>) -> Result<()> {
        while self.running {
            match event_loop.dispatch(Some(self.config.tick), self) {
                Ok(()) if self.running => self.refresh(),
                Ok(()) => {}
                Err(err) => self.stop(Error::EventLoop(err.into())),
            }
        }

        tracing::info!("event loop exited");
        self.shutdown(event_loop);

        match self.fatal.take() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// read one batch of completion events
    pub fn dispatch(&mut self) {
        let events = match self.device.flip_events() {
            Ok(events) => events,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(err) => {
                self.stop(Error::ReadEvents(err));
                return;
            }
        };

        for event in events {
            self.page_flip(&event);
        }
    }

    fn page_flip(&mut self, event: &FlipEvent) {
        let Some(output) = self.outputs.by_crtc_mut(event.crtc) else {
            tracing::warn!("page-flip for unknown crtc {}", event.crtc);
            return;
        };

        if !output.page_flip(event) {
            return;
        }

        let result = output
            .draw(&self.device, &mut self.rng, self.config.color_step)
            .map_err(|err| (output.name().to_owned(), err));
        if let Err((name, err)) = result {
            self.frame_failed(&name, err);
        }
    }

    /// submit a frame on every output that is idle and not winding down
    pub fn refresh(&mut self) {
        let mut failures = Vec::new();
        for output in self.outputs.iter_mut().filter(|output| output.wants_frame()) {
            if let Err(err) = output.draw(&self.device, &mut self.rng, self.config.color_step) {
                failures.push((output.name().to_owned(), err));
            }
        }

        for (name, err) in failures {
            self.frame_failed(&name, err);
        }
    }

    fn frame_failed(&mut self, name: &str, err: Error) {
        if err.kind() == ErrorKind::TransactionRejected {
            tracing::warn!("{name}: {err}");
            return;
        }

        tracing::error!("{name}: {err}");
        self.running = false;
        self.fatal.get_or_insert(err);
    }

    /// end the run, `err` becomes its result unless an earlier error already is
    fn stop(&mut self, err: Error) {
        tracing::error!("{err}");
        self.running = false;
        self.fatal.get_or_insert(err);
    }

    /// stop drawing, wait for every in-flight flip and release the outputs
    ///
    /// waiting is bounded by the drain timeout, outputs whose flip never
    /// completes are leaked rather than released under the hardware
    pub fn shutdown(&mut self, event_loop: &mut EventLoop<'static, Self>) {
        self.outputs.request_cleanup();

        let deadline = Instant::now() + self.config.drain_timeout;
        if self.outputs.has_pending() {
            tracing::info!("wait for pending page-flip to complete...");
        }

        while self.outputs.has_pending() {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!("timed out waiting for page-flips");
                break;
            }
            if let Err(err) = event_loop.dispatch(Some(deadline - now), self) {
                tracing::error!("loop error: {err:?}");
                break;
            }
        }

        self.outputs.release(&self.device);
    }
}
