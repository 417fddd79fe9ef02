//! Interface de terminal do botvisor: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`LifecycleProgress`] acompanha visualmente
//! cada etapa do ciclo de vida de um bot no terminal.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use botvisor::repository::{BotEvent, EVENT_HEALTH_CHECK_FAILED, EVENT_JOB_FAILED};
use botvisor::state_machine::{BotStatus, JobType};

/// Indicador visual de progresso para as etapas do ciclo de vida de um bot.
///
/// Exibe um spinner animado enquanto um job está em andamento e mensagens
/// coloridas para sucesso (verde), falha (vermelho) e avisos (amarelo).
pub struct LifecycleProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl LifecycleProgress {
    /// Inicia o spinner com a descrição inicial.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(description.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Atualiza o spinner para o job que está sendo executado.
    pub fn job(&self, job_type: JobType) {
        self.pb.set_message(format!("{job_type}"));
    }

    /// Registra o fim de uma etapa com o status atual do bot.
    pub fn step_done(&self, job_type: JobType, status: Option<BotStatus>) {
        let status = status.map_or_else(|| "-".to_string(), |s| s.to_string());
        self.pb.println(format!(
            "  {} {job_type} {} {status}",
            self.green.apply_to("✓"),
            self.dim.apply_to("→"),
        ));
    }

    /// Exibe um aviso sem interromper o spinner.
    pub fn warn(&self, message: &str) {
        self.pb
            .println(format!("  {} {message}", self.yellow.apply_to("!")));
    }

    /// Finaliza o spinner com sucesso ou falha.
    pub fn finish(&self, ok: bool, message: &str) {
        self.pb.finish_and_clear();
        if ok {
            println!("  {} {message}", self.green.apply_to("✓"));
        } else {
            println!("  {} {message}", self.red.apply_to("✗"));
        }
    }

    /// Imprime a trilha de auditoria do bot, um evento por linha.
    pub fn print_events(&self, events: &[BotEvent]) {
        println!();
        println!("{}", self.yellow.apply_to("─── Audit Trail ───"));
        for event in events {
            let style = match event.event_type.as_str() {
                EVENT_JOB_FAILED => &self.red,
                EVENT_HEALTH_CHECK_FAILED => &self.yellow,
                _ => &self.green,
            };
            let payload = event
                .payload
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_default();
            println!(
                "{} {} {payload}",
                self.dim.apply_to(event.created_at.format("%H:%M:%S%.3f")),
                style.apply_to(&event.event_type),
            );
        }
    }
}
