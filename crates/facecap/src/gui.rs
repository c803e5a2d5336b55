//! The capture window.
//!
//! The egui update loop is the only thread that touches the controller or the
//! camera. The display loop piggybacks on it: each update polls one frame once
//! `poll_interval` has elapsed and asks egui to repaint after another interval.

use anyhow::Result;
use eframe::egui::{self, load::SizedTexture, Align2, ColorImage, RichText, TextureHandle};
use facecap_core::{
    Activity, Config, Controller, ControllerError, SessionError, Tick, V4lCameraProvider,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_VIDEO_WIDTH: f32 = 640.0;

pub fn run(config: Config) -> Result<()> {
    let mut viewport = egui::ViewportBuilder::default()
        .with_title("Webcam App")
        .with_inner_size([800.0, 600.0]);
    if config.fullscreen {
        viewport = viewport.with_fullscreen(true);
    }
    let options = eframe::NativeOptions {
        viewport,
        ..Default::default()
    };

    eframe::run_native(
        "Webcam App",
        options,
        Box::new(move |cc| Ok(Box::new(WebcamApp::new(cc, &config)))),
    )
    .map_err(|e| anyhow::anyhow!("window failed: {e}"))
}

enum Action {
    Start,
    Capture,
    Stage(String),
    Close,
}

struct Warning {
    title: String,
    message: String,
}

struct WebcamApp {
    controller: Controller<V4lCameraProvider>,
    directory_name: String,
    poll_interval: Duration,
    last_poll: Option<Instant>,
    video: Option<TextureHandle>,
    warning: Option<Warning>,
    status: String,
}

impl WebcamApp {
    fn new(cc: &eframe::CreationContext<'_>, config: &Config) -> Self {
        let mut controller = Controller::new(
            config,
            V4lCameraProvider {
                device: config.camera_device.clone(),
            },
        );

        let ctx = cc.egui_ctx.clone();
        controller.set_notifier(Arc::new(move || ctx.request_repaint()));

        Self {
            controller,
            directory_name: String::new(),
            poll_interval: config.poll_interval(),
            last_poll: None,
            video: None,
            warning: None,
            status: String::new(),
        }
    }

    fn warn(&mut self, title: &str, message: impl Into<String>) {
        self.warning = Some(Warning {
            title: title.to_string(),
            message: message.into(),
        });
    }

    /// Apply a finished stage reported by the worker thread.
    fn drain_stage_events(&mut self, ctx: &egui::Context) {
        if let Some(done) = self.controller.poll_stage_events() {
            self.status = format!("{}: {}", done.name, done.exit);
            if done.close_after {
                tracing::info!(stage = %done.name, "closing after stage");
                self.close(ctx);
            }
        }
    }

    fn poll_video(&mut self, ctx: &egui::Context) {
        if self.controller.activity() != Activity::Capturing {
            return;
        }

        let due = self
            .last_poll
            .map_or(true, |at| at.elapsed() >= self.poll_interval);
        if due {
            self.last_poll = Some(Instant::now());
            match self.controller.tick() {
                Tick::Frame(frame) => {
                    let image = ColorImage::from_rgb(
                        [frame.width as usize, frame.height as usize],
                        &frame.data,
                    );
                    if let Some(texture) = self.video.as_mut() {
                        texture.set(image, egui::TextureOptions::LINEAR);
                    } else {
                        self.video =
                            Some(ctx.load_texture("webcam", image, egui::TextureOptions::LINEAR));
                    }
                }
                Tick::Skipped | Tick::Idle => {}
                Tick::Stopped => {
                    self.video = None;
                    self.status = "Camera closed".to_string();
                }
            }
        }

        ctx.request_repaint_after(self.poll_interval);
    }

    fn apply(&mut self, action: Action, ctx: &egui::Context) {
        match action {
            Action::Start => match self.controller.start(&self.directory_name) {
                Ok(()) => {
                    self.last_poll = None;
                    if let Some(dir) = self.controller.session_dir() {
                        self.status = format!("Capturing into {}", dir.display());
                    }
                }
                Err(ControllerError::Session(SessionError::EmptyName)) => {
                    self.warn("Invalid Directory", "Please enter a valid directory name.");
                }
                Err(ControllerError::Session(e @ SessionError::InvalidName(_))) => {
                    self.warn("Invalid Directory", e.to_string());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to start capture");
                    self.warn("Cannot Start Camera", e.to_string());
                }
            },
            Action::Capture => match self.controller.capture() {
                Ok(outcome) if outcome.complete => {
                    self.video = None;
                    self.status = format!("Captured {} images", outcome.index);
                }
                Ok(outcome) => {
                    self.status = format!(
                        "Saved {} ({}/{})",
                        outcome.path.display(),
                        outcome.index,
                        self.controller.quota()
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "capture failed");
                    self.status = e.to_string();
                    if self.controller.activity() != Activity::Capturing {
                        self.video = None;
                    }
                }
            },
            Action::Stage(name) => match self.controller.run_stage(&name) {
                Ok(()) => self.status = format!("Running {name}"),
                Err(ControllerError::Busy(reason)) => {
                    tracing::debug!(stage = %name, reason = %reason, "stage trigger ignored");
                }
                Err(e) => self.warn("Cannot Run Stage", e.to_string()),
            },
            Action::Close => self.close(ctx),
        }
    }

    fn close(&mut self, ctx: &egui::Context) {
        self.controller.shutdown();
        self.video = None;
        ctx.send_viewport_cmd(egui::ViewportCommand::Close);
    }
}

impl eframe::App for WebcamApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain_stage_events(ctx);
        self.poll_video(ctx);

        let controls = self.controller.controls();
        let mut action = None;

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.vertical_centered(|ui| {
                ui.add_space(10.0);
                ui.label(RichText::new("Face Recognition").size(20.0).strong());
                ui.add_space(10.0);

                if controls.show_video {
                    egui::Frame::group(ui.style()).show(ui, |ui| match &self.video {
                        Some(texture) => {
                            let size = texture.size_vec2();
                            let scale = (MAX_VIDEO_WIDTH / size.x).min(1.0);
                            ui.image(SizedTexture::new(texture.id(), size * scale));
                        }
                        None => {
                            ui.allocate_space(egui::vec2(MAX_VIDEO_WIDTH, MAX_VIDEO_WIDTH * 0.75));
                        }
                    });
                    ui.add_space(10.0);
                }

                ui.horizontal(|ui| {
                    if ui
                        .add_enabled(controls.capture, egui::Button::new("Capture Image"))
                        .clicked()
                    {
                        action = Some(Action::Capture);
                    }
                    for stage in self.controller.stages() {
                        if ui
                            .add_enabled(controls.stages, egui::Button::new(&stage.label))
                            .clicked()
                        {
                            action = Some(Action::Stage(stage.name.clone()));
                        }
                    }
                    if ui
                        .add_enabled(controls.close, egui::Button::new("Close"))
                        .clicked()
                    {
                        action = Some(Action::Close);
                    }
                    if controls.loading {
                        ui.add(egui::Spinner::new());
                        ui.label(RichText::new("Loading...").size(14.0).strong());
                    }
                });
                ui.add_space(10.0);

                ui.horizontal(|ui| {
                    ui.label("Enter Directory Name:");
                    let entry = ui.add_enabled(
                        controls.directory_input,
                        egui::TextEdit::singleline(&mut self.directory_name).desired_width(240.0),
                    );
                    let submitted =
                        entry.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter));
                    if ui
                        .add_enabled(controls.start, egui::Button::new("Start"))
                        .clicked()
                        || (submitted && controls.start)
                    {
                        action = Some(Action::Start);
                    }
                });

                if !self.status.is_empty() {
                    ui.add_space(10.0);
                    ui.label(&self.status);
                }
            });
        });

        if let Some(warning) = &self.warning {
            let mut dismissed = false;
            egui::Window::new(&warning.title)
                .collapsible(false)
                .resizable(false)
                .anchor(Align2::CENTER_CENTER, [0.0, 0.0])
                .show(ctx, |ui| {
                    ui.label(&warning.message);
                    if ui.button("OK").clicked() {
                        dismissed = true;
                    }
                });
            if dismissed {
                self.warning = None;
            }
        }

        if let Some(action) = action {
            let before = self.controller.activity();
            self.apply(action, ctx);
            if starts_display_loop(&before, &self.controller.activity()) {
                // poll_video already ran for this frame while idle.
                ctx.request_repaint();
            }
        }
    }
}

/// A transition into capture needs an immediate repaint to run the first poll.
fn starts_display_loop(before: &Activity, after: &Activity) -> bool {
    *before != Activity::Capturing && *after == Activity::Capturing
}

impl Drop for WebcamApp {
    fn drop(&mut self) {
        self.controller.shutdown();
    }
}
