/// Balance tuner GUI
///
/// Run with: cargo run --bin tuner_gui

use anyhow::Result;
use balance_tuner::config_loader::{
    default_config_path, default_presets_path, load_presets, load_tuner_settings, GainPreset, TunerSettings,
};
use balance_tuner::gains::Coefficient;
use balance_tuner::manual_tuner::{moving_average, LiveStats, ManualTuner, SMOOTH_WINDOW};
use balance_tuner::search::{SearchConfig, SessionSnapshot};
use balance_tuner::session::TuningSession;
use balance_tuner::telemetry::TelemetryLink;
use balance_tuner::udp_link::{local_ip_address, UdpTelemetryLink};
use eframe::egui;
use egui_plot::{Bar, BarChart, Legend, Line, Plot, PlotPoints};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

const MAX_MESSAGES: usize = 200;

struct TunerGui {
    link: Arc<UdpTelemetryLink>,
    session: TuningSession,
    manual: ManualTuner,
    settings: TunerSettings,
    presets: BTreeMap<String, GainPreset>,
    selected_preset: String,
    local_ip: Option<IpAddr>,
    known_device: Option<SocketAddr>,
    last_ack: Option<String>,
    last_status: String,
    messages: Vec<String>,
}

impl TunerGui {
    fn new() -> Result<Self> {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let settings = load_tuner_settings(&default_config_path(), &hostname)?;
        let presets = match load_presets(&default_presets_path()) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Presets unavailable: {}", e);
                BTreeMap::new()
            }
        };

        let link = Arc::new(UdpTelemetryLink::from_settings(&settings)?);
        let telemetry: Arc<dyn TelemetryLink> = link.clone();
        let session = TuningSession::new(Arc::clone(&telemetry), SearchConfig::from_settings(&settings))
            .with_poll_interval(settings.recv_timeout);
        let manual = ManualTuner::new(telemetry, settings.space, settings.start_gains, settings.send_interval);
        let local_ip = local_ip_address().ok();
        let selected_preset = presets.keys().next().cloned().unwrap_or_default();

        let mut gui = Self {
            link,
            session,
            manual,
            settings,
            presets,
            selected_preset,
            local_ip,
            known_device: None,
            last_ack: None,
            last_status: String::new(),
            messages: Vec::new(),
        };
        match gui.local_ip {
            Some(ip) => gui.append_message(&format!("Listening on {} (this PC: {})", gui.settings.udp_bind, ip)),
            None => gui.append_message(&format!("Listening on {}", gui.settings.udp_bind)),
        }
        Ok(gui)
    }

    /// Append a timestamped message, keeping the log bounded.
    fn append_message(&mut self, msg: &str) {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        self.messages.push(format!("[{}] {}", stamp, msg));
        if self.messages.len() > MAX_MESSAGES {
            let excess = self.messages.len() - MAX_MESSAGES;
            self.messages.drain(..excess);
        }
    }

    /// Pick up link and search events since the last frame.
    fn poll_events(&mut self, snap: &SessionSnapshot) {
        let device = self.link.device();
        if device != self.known_device {
            self.known_device = device;
            if let Some(addr) = device {
                self.append_message(&format!("Robot connected at {}", addr));
                let g = self.manual.force_send();
                self.append_message(&format!("Sent {}", g.to_command()));
            }
        }

        let ack = self.link.stats().last_ack();
        if ack.is_some() && ack != self.last_ack {
            self.append_message(&format!("Robot ack: {}", ack.as_deref().unwrap_or_default()));
            self.last_ack = ack;
        }

        if snap.status != self.last_status {
            self.last_status = snap.status.clone();
            let status = snap.status.clone();
            self.append_message(&status);
        }

        if !snap.active && self.manual.flush() {
            log::debug!("Manual gains sent: {}", self.manual.get_gains());
        }
    }

    fn gain_controls(&mut self, ui: &mut egui::Ui, enabled: bool) {
        ui.heading("Gains");
        for c in Coefficient::ALL {
            let bound = *self.manual.space().bound(c);
            let mut value = self.manual.get_gains().get(c);
            ui.add_enabled_ui(enabled, |ui| {
                ui.horizontal(|ui| {
                    if ui.button("-").clicked() {
                        self.manual.nudge(c, -1.0);
                    }
                    let slider = egui::Slider::new(&mut value, bound.min..=bound.max)
                        .step_by(bound.fine_step)
                        .text(c.label());
                    if ui.add(slider).changed() {
                        self.manual.set(c, value);
                    }
                    if ui.button("+").clicked() {
                        self.manual.nudge(c, 1.0);
                    }
                });
            });
        }

        ui.add_enabled_ui(enabled, |ui| {
            ui.horizontal(|ui| {
                if ui.button("Send now").clicked() {
                    let g = self.manual.force_send();
                    self.append_message(&format!("Sent {}", g.to_command()));
                }
                if ui.button("Reset").clicked() {
                    self.manual.set_gains(self.settings.start_gains);
                    let g = self.manual.force_send();
                    self.append_message(&format!("Reset to {}", g));
                }
            });

            if !self.presets.is_empty() {
                ui.horizontal(|ui| {
                    let selected_label = self
                        .presets
                        .get(&self.selected_preset)
                        .map(|p| p.NAME.clone())
                        .unwrap_or_default();
                    egui::ComboBox::from_id_source("preset_combo")
                        .selected_text(selected_label)
                        .show_ui(ui, |ui| {
                            for (key, preset) in &self.presets {
                                ui.selectable_value(&mut self.selected_preset, key.clone(), preset.NAME.as_str());
                            }
                        });
                    if ui.button("Load preset").clicked() {
                        if let Some(preset) = self.presets.get(&self.selected_preset).cloned() {
                            let g = self.manual.load_preset(&preset);
                            self.append_message(&format!("Preset {}: {}", preset.NAME, g));
                        }
                    }
                });
                if let Some(desc) = self.presets.get(&self.selected_preset).and_then(|p| p.DESCRIPTION.as_deref()) {
                    ui.small(desc);
                }
            }
        });
    }

    fn autotune_controls(&mut self, ui: &mut egui::Ui, snap: &SessionSnapshot) {
        ui.heading("Auto-tune");
        ui.horizontal(|ui| {
            let can_start = !snap.active && self.known_device.is_some() && !self.session.is_finishing();
            if ui.add_enabled(can_start, egui::Button::new("Start")).clicked() {
                self.session.set_start_gains(self.manual.get_gains());
                if self.session.start() {
                    self.append_message(&format!("Auto-tune started from {}", self.manual.get_gains()));
                }
            }
            if ui.add_enabled(snap.active, egui::Button::new("Stop")).clicked() {
                self.session.stop();
                self.manual.set_gains(self.session.snapshot().best_gains);
                self.append_message("Stopped, best gains sent");
            }
            if ui.add_enabled(!snap.results.is_empty(), egui::Button::new("Apply best")).clicked() {
                let best = self.session.apply_best();
                self.manual.set_gains(best);
                self.manual.force_send();
                self.append_message(&format!("Applied best {}", best));
            }
        });

        ui.label(format!("Phase: {}", snap.phase));
        ui.label(format!("Trial {}/{}  streak {}", snap.trial_index, snap.max_rounds, snap.no_improvement_streak));
        ui.label(format!("Testing: {}", snap.current_gains));
        ui.colored_label(
            egui::Color32::from_rgb(40, 160, 60),
            format!("Best: {}  score {:.1}", snap.best_gains, snap.best_score),
        );
        ui.label(snap.status.as_str());
    }

    fn stats_panel(&self, ui: &mut egui::Ui, angles: &[f64]) {
        ui.heading("Performance");
        match LiveStats::from_angles(angles) {
            Some(stats) => {
                ui.label(format!("RMS: {:.2}°", stats.rms));
                ui.label(format!("Max: {:.2}°", stats.max_abs));
                if stats.stable {
                    ui.colored_label(egui::Color32::from_rgb(40, 160, 60), "Stable");
                } else {
                    ui.colored_label(egui::Color32::RED, "Unstable");
                }
            }
            None => {
                ui.label("Waiting for data...");
            }
        }
    }
}

impl eframe::App for TunerGui {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let snap = self.session.snapshot();
        self.poll_events(&snap);

        let history = self.link.history();
        let angles: Vec<f64> = history.iter().map(|f| f.angle).collect();

        egui::TopBottomPanel::top("link_status").show(ctx, |ui| {
            ui.horizontal(|ui| {
                match self.known_device {
                    Some(addr) => ui.colored_label(egui::Color32::from_rgb(40, 160, 60), format!("Robot: {}", addr)),
                    None => ui.colored_label(egui::Color32::YELLOW, "Waiting for robot telemetry..."),
                };
                if let Some(ip) = self.local_ip {
                    ui.label(format!("This PC: {}:{}", ip, self.settings.udp_bind.port()));
                }
                let stats = self.link.stats();
                ui.label(format!(
                    "Packets: {}  Acks: {}  Dropped: {}",
                    stats.frames(), stats.acks(), stats.malformed()
                ));
                if let Some(last) = history.last() {
                    ui.label(format!("Angle: {:+.2}°", last.angle));
                    if let Some(m) = last.motor {
                        ui.label(format!("PWM: {:+.0}", m));
                    }
                }
            });
        });

        egui::SidePanel::left("controls").min_width(320.0).show(ctx, |ui| {
            egui::ScrollArea::vertical().show(ui, |ui| {
                self.gain_controls(ui, !snap.active);
                ui.separator();
                self.autotune_controls(ui, &snap);
                ui.separator();
                self.stats_panel(ui, &angles);
                ui.separator();
                ui.label("Messages:");
                egui::ScrollArea::vertical()
                    .id_source("messages")
                    .max_height(200.0)
                    .stick_to_bottom(true)
                    .show(ui, |ui| {
                        for m in &self.messages {
                            ui.monospace(m);
                        }
                    });
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            let plot_height = (ui.available_height() / 3.0 - 10.0).max(120.0);
            let smoothed = moving_average(&angles, SMOOTH_WINDOW);
            Plot::new("angle_plot")
                .height(plot_height)
                .legend(Legend::default())
                .include_y(-15.0)
                .include_y(15.0)
                .show(ui, |plot_ui| {
                    let raw: PlotPoints = angles.iter().enumerate().map(|(i, a)| [i as f64, *a]).collect();
                    let smooth: PlotPoints = smoothed.iter().enumerate().map(|(i, a)| [i as f64, *a]).collect();
                    plot_ui.line(Line::new(raw).name("angle (raw)").color(egui::Color32::from_gray(150)));
                    plot_ui.line(Line::new(smooth).name("angle").color(egui::Color32::from_rgb(200, 60, 60)));
                });

            let motor: Vec<f64> = history.iter().filter_map(|f| f.motor).collect();
            if !motor.is_empty() {
                let smoothed_motor = moving_average(&motor, SMOOTH_WINDOW);
                Plot::new("motor_plot")
                    .height(plot_height)
                    .legend(Legend::default())
                    .show(ui, |plot_ui| {
                        let pts: PlotPoints = smoothed_motor.iter().enumerate().map(|(i, m)| [i as f64, *m]).collect();
                        plot_ui.line(Line::new(pts).name("PWM").color(egui::Color32::from_rgb(60, 90, 200)));
                    });
            }

            ui.label(format!("Scores (best {:.1})", snap.best_score));
            let bars: Vec<Bar> = snap
                .results
                .iter()
                .map(|r| {
                    let color = if r.score == snap.best_score && r.gains == snap.best_gains {
                        egui::Color32::from_rgb(40, 160, 60)
                    } else {
                        egui::Color32::from_rgb(70, 130, 180)
                    };
                    Bar::new(r.trial_index as f64, r.score).fill(color).name(format!("#{} {}", r.trial_index, r.gains))
                })
                .collect();
            Plot::new("score_plot")
                .height(plot_height)
                .include_y(0.0)
                .show(ui, |plot_ui| {
                    plot_ui.bar_chart(BarChart::new(bars).width(0.7));
                });
        });

        ctx.request_repaint_after(Duration::from_millis(50));
    }
}

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title("Self-Balancing Robot Tuner")
            .with_inner_size([1100.0, 760.0]),
        ..Default::default()
    };

    if let Err(e) = eframe::run_native(
        "Balance Tuner",
        options,
        Box::new(|_cc| match TunerGui::new() {
            Ok(gui) => Box::new(gui),
            Err(e) => {
                eprintln!("Failed to create TunerGui: {}", e);
                std::process::exit(1);
            }
        }),
    ) {
        eprintln!("GUI error: {}", e);
        std::process::exit(1);
    }
}
