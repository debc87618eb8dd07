//! GPU inventory

use kiln_core::domain::gpu::Gpu;
use tracing::warn;

use crate::shell::{CommandRunner, Verbosity};

const QUERY_GPUS: &str = "nvidia-smi --query-gpu=index,name --format=csv,noheader";

/// Parses `index, name` CSV lines, skipping anything unreadable
pub fn parse_gpu_list(output: &str) -> Vec<Gpu> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let (index, name) = line.split_once(',')?;
            match index.trim().parse() {
                Ok(index) => Some(Gpu {
                    index,
                    name: name.trim().to_string(),
                }),
                Err(_) => {
                    warn!("Ignoring unreadable GPU line '{}'", line);
                    None
                }
            }
        })
        .collect()
}

/// Enumerates the host's GPUs; empty when the driver cannot be queried
pub async fn detect_gpus(shell: &dyn CommandRunner) -> Vec<Gpu> {
    shell
        .run(QUERY_GPUS, Verbosity::Normal)
        .await
        .map(|output| parse_gpu_list(&output))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gpu_list() {
        let gpus = parse_gpu_list(
            "0, NVIDIA GeForce RTX 3080\n1, NVIDIA GeForce RTX 3090, Ti Edition\n\n",
        );
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].index, 0);
        assert_eq!(gpus[0].name, "NVIDIA GeForce RTX 3080");
        assert_eq!(gpus[1].name, "NVIDIA GeForce RTX 3090, Ti Edition");
    }

    #[test]
    fn test_parse_gpu_list_skips_garbage() {
        let gpus = parse_gpu_list("NVIDIA-SMI has failed\nx, broken\n2, RTX A4000");
        assert_eq!(gpus, vec![Gpu { index: 2, name: "RTX A4000".to_string() }]);
    }
}
