//! Interface de linha de comando do botvisor baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (worker, demo, render,
//! encrypt, decrypt) e a flag global --verbose.

use clap::{Parser, Subcommand};

use botvisor::config::ProviderKind;

/// botvisor: orquestrador do ciclo de vida de VMs de bots.
#[derive(Debug, Parser)]
#[command(name = "botvisor", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Habilita saída detalhada (nível debug nos logs).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa o pool de workers até receber Ctrl-C.
    ///
    /// O repositório e a fila são em memória e começam vazios: sem um produtor
    /// embutido no mesmo processo nenhum job é entregue. Serve como ponto de
    /// partida para embutir o botvisor; use `demo` para ver um ciclo completo.
    Worker {
        /// Sobrescreve o provedor configurado.
        #[arg(long)]
        provider: Option<ProviderKind>,

        /// Sobrescreve o número de workers concorrentes.
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Executa o ciclo de vida completo de um bot contra o provedor fake.
    Demo {
        /// Identificador do bot de demonstração.
        #[arg(long, default_value = "demo-bot")]
        bot_id: String,
    },

    /// Renderiza os três documentos de bootstrap com parâmetros de exemplo.
    Render {
        /// Identificador do bot usado na renderização.
        #[arg(long, default_value = "sample-bot")]
        bot_id: String,
    },

    /// Cifra um valor com a chave mestra configurada.
    Encrypt {
        /// Texto em claro a cifrar.
        plaintext: String,
    },

    /// Decifra um valor no formato salt:iv:tag:data.
    Decrypt {
        /// Texto cifrado a decifrar.
        ciphertext: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_worker_subcommand() {
        let cli = Cli::parse_from([
            "botvisor",
            "worker",
            "--provider",
            "digitalocean",
            "--concurrency",
            "8",
        ]);
        match cli.command {
            Command::Worker {
                provider,
                concurrency,
            } => {
                assert_eq!(provider, Some(ProviderKind::DigitalOcean));
                assert_eq!(concurrency, Some(8));
            }
            _ => panic!("expected Worker command"),
        }
    }

    #[test]
    fn cli_worker_defaults_to_config() {
        let cli = Cli::parse_from(["botvisor", "worker"]);
        assert!(matches!(
            cli.command,
            Command::Worker {
                provider: None,
                concurrency: None
            }
        ));
    }

    #[test]
    fn cli_rejects_unknown_provider() {
        assert!(Cli::try_parse_from(["botvisor", "worker", "--provider", "aws"]).is_err());
    }

    #[test]
    fn cli_parses_global_verbose() {
        let cli = Cli::parse_from(["botvisor", "--verbose", "demo"]);
        assert!(cli.verbose);
        match cli.command {
            Command::Demo { bot_id } => assert_eq!(bot_id, "demo-bot"),
            _ => panic!("expected Demo command"),
        }
    }

    #[test]
    fn cli_parses_render_bot_id() {
        let cli = Cli::parse_from(["botvisor", "render", "--bot-id", "bot-42"]);
        match cli.command {
            Command::Render { bot_id } => assert_eq!(bot_id, "bot-42"),
            _ => panic!("expected Render command"),
        }
    }

    #[test]
    fn cli_parses_encrypt_and_decrypt() {
        let cli = Cli::parse_from(["botvisor", "encrypt", "sk-secret"]);
        assert!(matches!(cli.command, Command::Encrypt { plaintext } if plaintext == "sk-secret"));

        let cli = Cli::parse_from(["botvisor", "-v", "decrypt", "a:b:c:d"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Decrypt { ciphertext } if ciphertext == "a:b:c:d"));
    }

    #[test]
    fn worker_help_mentions_empty_in_memory_queue() {
        let cmd = Cli::command();
        let worker = cmd
            .get_subcommands()
            .find(|c| c.get_name() == "worker")
            .unwrap();
        let help = worker.get_long_about().unwrap().to_string();
        assert!(help.contains("em memória"));
        assert!(help.contains("demo"));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
