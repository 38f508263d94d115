#![allow(dead_code)]

//! soundboard - real-time audio passthrough
//!
//! Routes the selected input device straight to the selected output device.
//! A single toggle button starts and stops the pipeline; the pipeline itself
//! runs on its own thread and owns the audio stream.

use eframe::egui;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

mod audio;
mod settings;

use audio::{ActivityState, AudioPipeline, CpalBackend, RunOutcome};
use settings::AppSettings;

fn main() -> eframe::Result<()> {
    env_logger::init();
    log::info!("Starting soundboard");

    let settings = AppSettings::load();

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([800.0, 600.0])
            .with_title("SoundBoard"),
        ..Default::default()
    };

    log::info!("Running Sound Board GUI");
    eframe::run_native(
        "soundboard",
        options,
        Box::new(move |cc| Ok(Box::new(SoundBoardApp::new(cc, &settings)))),
    )
}

struct SoundBoardApp {
    pipeline: Arc<AudioPipeline>,
    /// Thread running the current (or last) `start`
    worker: Option<JoinHandle<RunOutcome>>,
    status: String,
}

impl SoundBoardApp {
    fn new(_cc: &eframe::CreationContext<'_>, settings: &AppSettings) -> Self {
        let backend = CpalBackend::new(settings.latency());
        let pipeline = AudioPipeline::new(settings.binding(), backend)
            .with_poll_interval(settings.poll_interval());

        Self {
            pipeline: Arc::new(pipeline),
            worker: None,
            status: "Stopped".to_string(),
        }
    }

    fn toggle(&mut self) {
        if self.pipeline.is_active() {
            self.pipeline.stop();
            self.status = "Stopping...".to_string();
            return;
        }

        if self.worker.as_ref().is_some_and(|w| !w.is_finished()) {
            // The last run is still closing its stream
            self.status = "Still stopping, try again".to_string();
            return;
        }

        match self.pipeline.spawn() {
            Ok(handle) => {
                self.worker = Some(handle);
                self.status = "Starting...".to_string();
            }
            Err(e) => {
                log::error!("Failed to start pipeline: {}", e);
                self.status = format!("Error: {}", e);
            }
        }
    }

    /// Collect the outcome of a finished run without blocking the UI
    fn reap_worker(&mut self) {
        if !self.worker.as_ref().is_some_and(|w| w.is_finished()) {
            return;
        }
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.status = match worker.join() {
            Ok(RunOutcome::Stopped) => "Stopped".to_string(),
            Ok(RunOutcome::AlreadyActive) => "Pipeline already active".to_string(),
            Ok(RunOutcome::Failed(e)) if e.is_open_failure() => format!(
                "Error: {} (devices are set in {})",
                e,
                settings::settings_path().display()
            ),
            Ok(RunOutcome::Failed(e)) => format!("Error: {}", e),
            Err(_) => {
                log::error!("Pipeline thread panicked");
                "Error: pipeline thread panicked".to_string()
            }
        };
    }
}

impl eframe::App for SoundBoardApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // State changes happen on other threads; keep polling them
        ctx.request_repaint_after(Duration::from_millis(100));
        self.reap_worker();

        let state = self.pipeline.state();

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.horizontal(|ui| {
                let button_text = match state {
                    ActivityState::Running => "⏸",
                    ActivityState::Idle | ActivityState::Error => "▶",
                };
                if ui
                    .button(egui::RichText::new(button_text).size(20.0))
                    .clicked()
                {
                    self.toggle();
                }

                ui.separator();
                ui.label(state.name());
                ui.separator();

                if state == ActivityState::Running {
                    ui.label("Passing audio through");
                } else {
                    ui.label(&self.status);
                }
            });

            if state == ActivityState::Error {
                if let Some(cause) = self.pipeline.last_failure() {
                    ui.colored_label(egui::Color32::LIGHT_RED, cause);
                }
            }

            ui.with_layout(egui::Layout::bottom_up(egui::Align::LEFT), |ui| {
                let binding = self.pipeline.binding();
                ui.small(format!(
                    "In: {} | Out: {} | Channels: {} | Poll: {} ms | Blocks: {}",
                    binding.input,
                    binding.output,
                    binding.channels,
                    self.pipeline.poll_interval().as_millis(),
                    self.pipeline.blocks_processed()
                ));
            });
        });
    }
}
