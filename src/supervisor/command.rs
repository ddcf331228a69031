//! Building the server invocation from a [`ServerConfig`].
//!
//! The command is a plain value ([`ServeCommand`]) so it can be inspected,
//! logged and tested without spawning anything.

use crate::config::{Dtype, ServerConfig, HOSTED_PREFIX};
use std::process::Stdio;
use tokio::process::Command;

/// Environment variables removed from the child's environment.
///
/// Numeric thread-count settings inherited from the parent corrupt the
/// server's internal message-passing transport.
pub const TRANSPORT_SENSITIVE_ENV: [&str; 3] =
    ["OMP_NUM_THREADS", "ZMQ_IO_THREADS", "ZEROMQ_IO_THREADS"];

/// Device profile baked into a command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    Accelerator,
    Cpu,
}

/// A fully-resolved server invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ServeCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Variables stripped from the inherited environment.
    pub removed_env: Vec<String>,
    pub device: DeviceProfile,
}

impl ServeCommand {
    /// An arbitrary command with the standard environment sanitation.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            removed_env: TRANSPORT_SENSITIVE_ENV.iter().map(|s| s.to_string()).collect(),
            device: DeviceProfile::Accelerator,
        }
    }

    /// The `serve` invocation for `config`.
    ///
    /// `accelerator` is the outcome of the hardware probe. Quantized (AWQ)
    /// models force `float16` and add an explicit quantization flag,
    /// whatever dtype the caller asked for.
    pub fn for_server(config: &ServerConfig, accelerator: bool) -> Self {
        let model = served_model_name(&config.model_name).to_string();
        let quantized = is_quantized(&config.model_name);
        let dtype = if quantized { Dtype::Float16 } else { config.dtype };

        let mut args: Vec<String> = vec![
            "serve".into(),
            model.clone(),
            "--host".into(),
            config.host.clone(),
            "--port".into(),
            config.port.to_string(),
            "--dtype".into(),
            dtype.as_str().into(),
            "--limit-mm-per-prompt".into(),
            format!("image={},video=0", config.max_num_imgs),
            "--served-model-name".into(),
            model,
            "--max-model-len".into(),
            config.max_model_len.to_string(),
            "--enforce-eager".into(),
            "--disable-log-stats".into(),
        ];

        let device = if accelerator {
            args.push("--gpu-memory-utilization".into());
            args.push(config.gpu_memory_utilization.to_string());
            DeviceProfile::Accelerator
        } else {
            args.push("--device".into());
            args.push("cpu".into());
            DeviceProfile::Cpu
        };

        if quantized {
            args.push("--quantization".into());
            args.push("awq".into());
        }

        Self {
            device,
            ..Self::new(config.program.clone(), args)
        }
    }

    /// Render as a shell-like line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Build the tokio command: sanitized environment, piped output,
    /// killed if the handle is dropped while the child still runs.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for key in &self.removed_env {
            cmd.env_remove(key);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Model name as served, without the client routing prefix.
pub fn served_model_name(model: &str) -> &str {
    model.strip_prefix(HOSTED_PREFIX).unwrap_or(model)
}

/// Whether the model identifier names an AWQ-quantized variant.
pub fn is_quantized(model: &str) -> bool {
    model.to_ascii_lowercase().contains("awq")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_after<'a>(cmd: &'a ServeCommand, flag: &str) -> Option<&'a str> {
        cmd.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| cmd.args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn accelerator_command_has_memory_fraction() {
        let config = ServerConfig::default();
        let cmd = ServeCommand::for_server(&config, true);

        assert_eq!(cmd.program, "vllm");
        assert_eq!(cmd.args[0], "serve");
        assert_eq!(cmd.args[1], "Qwen/Qwen2.5-VL-3B-Instruct");
        assert_eq!(value_after(&cmd, "--dtype"), Some("bfloat16"));
        assert_eq!(value_after(&cmd, "--limit-mm-per-prompt"), Some("image=5,video=0"));
        assert_eq!(value_after(&cmd, "--max-model-len"), Some("15000"));
        assert_eq!(value_after(&cmd, "--gpu-memory-utilization"), Some("0.98"));
        assert!(cmd.args.iter().any(|a| a == "--enforce-eager"));
        assert!(cmd.args.iter().any(|a| a == "--disable-log-stats"));
        assert!(!cmd.args.iter().any(|a| a == "--device"));
        assert_eq!(cmd.device, DeviceProfile::Accelerator);
    }

    #[test]
    fn cpu_command_omits_memory_fraction() {
        let cmd = ServeCommand::for_server(&ServerConfig::default(), false);
        assert_eq!(value_after(&cmd, "--device"), Some("cpu"));
        assert!(!cmd.args.iter().any(|a| a == "--gpu-memory-utilization"));
        assert_eq!(cmd.device, DeviceProfile::Cpu);
    }

    #[test]
    fn awq_model_forces_float16_and_quantization() {
        let config = ServerConfig::builder()
            .model_name("hosted_vllm/Qwen/Qwen2.5-VL-7B-Instruct-AWQ")
            .dtype(Dtype::BFloat16)
            .build()
            .unwrap();
        let cmd = ServeCommand::for_server(&config, true);

        assert_eq!(cmd.args[1], "Qwen/Qwen2.5-VL-7B-Instruct-AWQ");
        assert_eq!(value_after(&cmd, "--served-model-name"), Some("Qwen/Qwen2.5-VL-7B-Instruct-AWQ"));
        assert_eq!(value_after(&cmd, "--dtype"), Some("float16"));
        assert_eq!(value_after(&cmd, "--quantization"), Some("awq"));
    }

    #[test]
    fn sanitized_env_is_removed_from_child() {
        let cmd = ServeCommand::new("true", Vec::<String>::new()).to_command();
        let removed: Vec<String> = cmd
            .as_std()
            .get_envs()
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| k.to_string_lossy().into_owned())
            .collect();
        for key in TRANSPORT_SENSITIVE_ENV {
            assert!(removed.iter().any(|k| k == key), "{key} not removed");
        }
    }

    #[test]
    fn display_joins_program_and_args() {
        let cmd = ServeCommand::new("sh", ["-c", "exit 0"]);
        assert_eq!(cmd.display(), "sh -c exit 0");
    }
}
