//! 硬件检测
//!
//! 同一套探测逻辑，通过 [`CommandExecutor`] 在本机或 SSH 通道上运行。
//! 探测命令失败（未安装、非零退出、超时）只代表该能力不存在；
//! 只有连接层错误会中止检测。

use tracing::{debug, info};

use crate::domain::hardware::{
    Confidence, Detection, HardwareCapability, HardwareVariant, NvidiaInfo, RocmInfo,
};
use crate::infra::command::{CommandExecutor, ExecError, ExecOutput};

/// Strix Halo / Ryzen AI Max 的 CPU 型号特征（小写）
const STRIX_SIGNATURES: &[&str] = &["ryzen ai max", "strix halo", "radeon 8060s", "radeon 8050s"];

/// 硬件检测器（无状态，每次检测重新探测）
pub struct HardwareDetector;

impl HardwareDetector {
    /// 探测目标机器
    pub async fn detect(executor: &dyn CommandExecutor) -> Result<HardwareCapability, ExecError> {
        let target = executor.target();

        let architecture = match probe(executor, "uname -m").await? {
            Some(out) if !out.stdout.trim().is_empty() => out.stdout.trim().to_string(),
            _ => executor.arch_hint().unwrap_or_else(|| "unknown".to_string()),
        };

        if is_arm(&architecture) {
            info!(target = %target, arch = %architecture, "ARM architecture is not supported");
            return Ok(HardwareCapability::unsupported(
                architecture.clone(),
                format!(
                    "{} is not supported: service images are published for x86_64 only",
                    architecture
                ),
            ));
        }

        let docker_version = probe(executor, "docker --version")
            .await?
            .and_then(|out| parse_docker_version(&out.stdout));
        let docker_available = docker_version.is_some();

        let nvidia = Self::probe_nvidia(executor).await?;
        let rocm = Self::probe_rocm(executor).await?;

        let cpu_model = match probe(executor, "cat /proc/cpuinfo").await? {
            Some(out) => parse_cpu_model(&out.stdout),
            None => None,
        };
        let cpu_model = match cpu_model {
            Some(model) => Some(model),
            None => probe(executor, "lscpu")
                .await?
                .and_then(|out| parse_cpu_model(&out.stdout)),
        };
        let strix = cpu_model.as_deref().map_or(false, is_strix);

        let vulkan = probe(executor, "vulkaninfo --summary")
            .await?
            .map_or(false, |out| out.stdout.contains("GPU"));

        let (variant, confidence) = recommend(&nvidia, &rocm, strix, vulkan);

        info!(
            target = %target,
            arch = %architecture,
            docker = docker_available,
            variant = %variant,
            confidence = ?confidence,
            "Hardware detected"
        );

        Ok(HardwareCapability {
            architecture,
            docker_available,
            docker_version,
            nvidia,
            rocm,
            strix,
            cpu_model,
            vulkan,
            detection: Detection::Supported { variant },
            confidence,
        })
    }

    async fn probe_nvidia(executor: &dyn CommandExecutor) -> Result<NvidiaInfo, ExecError> {
        let Some(out) = probe(executor, "nvidia-smi --query-gpu=name --format=csv,noheader").await?
        else {
            return Ok(NvidiaInfo::default());
        };
        let gpu_name = out
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string);
        if gpu_name.is_none() {
            return Ok(NvidiaInfo::default());
        }

        let mut cuda_version = probe(executor, "nvcc --version")
            .await?
            .and_then(|out| parse_nvcc_version(&out.stdout));
        if cuda_version.is_none() {
            cuda_version = probe(executor, "nvidia-smi")
                .await?
                .and_then(|out| parse_smi_cuda_banner(&out.stdout));
        }

        Ok(NvidiaInfo {
            present: true,
            gpu_name,
            cuda_version,
        })
    }

    async fn probe_rocm(executor: &dyn CommandExecutor) -> Result<RocmInfo, ExecError> {
        let Some(out) = probe(executor, "rocm-smi --showproductname").await? else {
            return Ok(RocmInfo::default());
        };
        let product_name = parse_rocm_product(&out.stdout);
        let version = probe(executor, "cat /opt/rocm/.info/version")
            .await?
            .and_then(|out| out.stdout_if_success().map(str::to_string));

        Ok(RocmInfo {
            present: true,
            product_name,
            version,
        })
    }
}

/// 执行探测命令：成功返回输出；失败返回 None；连接错误向上传播
async fn probe(
    executor: &dyn CommandExecutor,
    command: &str,
) -> Result<Option<ExecOutput>, ExecError> {
    match executor.exec(command, None).await {
        Ok(out) if out.success() => Ok(Some(out)),
        Ok(out) => {
            debug!(command = %command, code = ?out.exit_code, "Probe reported absent");
            Ok(None)
        }
        Err(e) if e.is_connection() => Err(e),
        Err(e) => {
            debug!(command = %command, error = %e, "Probe failed");
            Ok(None)
        }
    }
}

/// 变体优先级：NVIDIA > Strix > ROCm > Vulkan > CPU
pub fn recommend(
    nvidia: &NvidiaInfo,
    rocm: &RocmInfo,
    strix: bool,
    vulkan: bool,
) -> (HardwareVariant, Confidence) {
    if nvidia.present {
        let confidence = if nvidia.cuda_version.is_some() {
            Confidence::High
        } else {
            Confidence::Medium
        };
        (HardwareVariant::Cuda, confidence)
    } else if strix {
        (HardwareVariant::Strix, Confidence::High)
    } else if rocm.present {
        let confidence = if rocm.version.is_some() {
            Confidence::High
        } else {
            Confidence::Medium
        };
        (HardwareVariant::Rocm, confidence)
    } else if vulkan {
        (HardwareVariant::Vulkan, Confidence::Low)
    } else {
        (HardwareVariant::Cpu, Confidence::High)
    }
}

pub fn is_arm(architecture: &str) -> bool {
    let arch = architecture.trim().to_lowercase();
    arch.starts_with("arm") || arch.starts_with("aarch64")
}

pub fn is_strix(cpu_model: &str) -> bool {
    let model = cpu_model.to_lowercase();
    STRIX_SIGNATURES.iter().any(|sig| model.contains(sig))
}

/// "Docker version 24.0.7, build afdd53b" -> "24.0.7"
pub fn parse_docker_version(output: &str) -> Option<String> {
    let rest = output.trim().strip_prefix("Docker version ")?;
    let version = rest.split(',').next()?.trim();
    (!version.is_empty()).then(|| version.to_string())
}

/// "Cuda compilation tools, release 12.2, V12.2.140" -> "12.2"
pub fn parse_nvcc_version(output: &str) -> Option<String> {
    let line = output.lines().find(|l| l.contains("release"))?;
    let after = line.split("release").nth(1)?;
    let version = after.trim().split(',').next()?.trim();
    (!version.is_empty()).then(|| version.to_string())
}

/// nvidia-smi 表头里的 "CUDA Version: 12.4"
pub fn parse_smi_cuda_banner(output: &str) -> Option<String> {
    let after = output.split("CUDA Version:").nth(1)?;
    let version = after.split_whitespace().next()?.trim_end_matches('|');
    (!version.is_empty()).then(|| version.to_string())
}

/// rocm-smi 的 "Card series:" 行
pub fn parse_rocm_product(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|l| l.split("Card series:").nth(1).or_else(|| l.split("Card SKU:").nth(1)))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// 从 /proc/cpuinfo 或 lscpu 取 CPU 型号
pub fn parse_cpu_model(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        let key = key.trim().to_lowercase();
        (key == "model name" && !value.trim().is_empty()).then(|| value.trim().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedExecutor;

    const CPUINFO_EPYC: &str = "processor\t: 0\nvendor_id\t: AuthenticAMD\nmodel name\t: AMD EPYC 7B13\n";
    const CPUINFO_STRIX: &str = "model name\t: AMD RYZEN AI MAX+ 395 w/ Radeon 8060S\n";

    #[tokio::test]
    async fn test_arm_short_circuits_after_one_command() {
        let exec = ScriptedExecutor::new().respond("uname -m", "aarch64\n");
        let cap = HardwareDetector::detect(&exec).await.unwrap();

        assert!(!cap.is_supported());
        assert!(cap.unsupported_reason().unwrap().contains("aarch64"));
        assert_eq!(cap.confidence, Confidence::High);
        assert_eq!(exec.commands(), vec!["uname -m".to_string()]);
    }

    #[tokio::test]
    async fn test_arch_hint_used_when_uname_missing() {
        let exec = ScriptedExecutor::new().with_arch_hint("arm64");
        let cap = HardwareDetector::detect(&exec).await.unwrap();
        assert_eq!(cap.architecture, "arm64");
        assert!(!cap.is_supported());
        assert_eq!(exec.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_plain_cpu_host_is_cpu_high() {
        let exec = ScriptedExecutor::new()
            .respond("uname -m", "x86_64\n")
            .respond("docker --version", "Docker version 24.0.7, build afdd53b\n")
            .respond("cat /proc/cpuinfo", CPUINFO_EPYC);
        let cap = HardwareDetector::detect(&exec).await.unwrap();

        assert_eq!(cap.recommended(), Some(HardwareVariant::Cpu));
        assert_eq!(cap.confidence, Confidence::High);
        assert!(cap.docker_available);
        assert_eq!(cap.docker_version.as_deref(), Some("24.0.7"));
        assert_eq!(cap.cpu_model.as_deref(), Some("AMD EPYC 7B13"));
    }

    #[tokio::test]
    async fn test_nvidia_without_toolkit_is_medium() {
        let exec = ScriptedExecutor::new()
            .respond("uname -m", "x86_64\n")
            .respond("nvidia-smi --query-gpu", "NVIDIA GeForce RTX 4090\n")
            .respond_output("nvidia-smi", ExecOutput::failed(9, "NVIDIA-SMI has failed"))
            .respond("rocm-smi", "GPU[0] : Card series: Radeon RX 7900 XTX\n");
        let cap = HardwareDetector::detect(&exec).await.unwrap();

        assert_eq!(cap.recommended(), Some(HardwareVariant::Cuda));
        assert_eq!(cap.confidence, Confidence::Medium);
        assert_eq!(cap.nvidia.gpu_name.as_deref(), Some("NVIDIA GeForce RTX 4090"));
        assert!(cap.rocm.present);
    }

    #[tokio::test]
    async fn test_nvidia_toolkit_from_smi_banner() {
        let exec = ScriptedExecutor::new()
            .respond("uname -m", "x86_64\n")
            .respond("nvidia-smi --query-gpu", "Tesla T4\n")
            .respond(
                "nvidia-smi",
                "| NVIDIA-SMI 550.54.15    Driver Version: 550.54.15    CUDA Version: 12.4     |\n",
            );
        let cap = HardwareDetector::detect(&exec).await.unwrap();
        assert_eq!(cap.nvidia.cuda_version.as_deref(), Some("12.4"));
        assert_eq!(cap.confidence, Confidence::High);
    }

    #[tokio::test]
    async fn test_strix_beats_rocm() {
        let exec = ScriptedExecutor::new()
            .respond("uname -m", "x86_64\n")
            .respond("rocm-smi", "GPU[0] : Card series: Radeon 8060S\n")
            .respond("cat /opt/rocm/.info/version", "6.2.0-66\n")
            .respond("cat /proc/cpuinfo", CPUINFO_STRIX);
        let cap = HardwareDetector::detect(&exec).await.unwrap();

        assert!(cap.strix);
        assert_eq!(cap.rocm.version.as_deref(), Some("6.2.0-66"));
        assert_eq!(cap.recommended(), Some(HardwareVariant::Strix));
        assert_eq!(cap.confidence, Confidence::High);
    }

    #[tokio::test]
    async fn test_rocm_without_version_is_medium() {
        let exec = ScriptedExecutor::new()
            .respond("uname -m", "x86_64\n")
            .respond("rocm-smi", "GPU[0] : Card series: Radeon RX 7900 XTX\n")
            .respond("cat /proc/cpuinfo", CPUINFO_EPYC);
        let cap = HardwareDetector::detect(&exec).await.unwrap();
        assert_eq!(cap.recommended(), Some(HardwareVariant::Rocm));
        assert_eq!(cap.confidence, Confidence::Medium);
        assert_eq!(cap.rocm.product_name.as_deref(), Some("Radeon RX 7900 XTX"));
    }

    #[tokio::test]
    async fn test_vulkan_only_is_low() {
        let exec = ScriptedExecutor::new()
            .respond("uname -m", "x86_64\n")
            .respond("lscpu", "Model name:  Intel(R) Core(TM) i7-1165G7\n")
            .respond("vulkaninfo", "Devices:\n========\nGPU0:\n\tdeviceName = Intel(R) Xe Graphics\n");
        let cap = HardwareDetector::detect(&exec).await.unwrap();
        assert_eq!(cap.recommended(), Some(HardwareVariant::Vulkan));
        assert_eq!(cap.confidence, Confidence::Low);
        assert_eq!(cap.cpu_model.as_deref(), Some("Intel(R) Core(TM) i7-1165G7"));
    }

    #[tokio::test]
    async fn test_probe_timeout_is_absence() {
        let exec = ScriptedExecutor::new()
            .respond("uname -m", "x86_64\n")
            .time_out("nvidia-smi");
        let cap = HardwareDetector::detect(&exec).await.unwrap();
        assert!(!cap.nvidia.present);
        assert_eq!(cap.recommended(), Some(HardwareVariant::Cpu));
    }

    #[tokio::test]
    async fn test_connection_error_is_fatal() {
        let exec = ScriptedExecutor::new()
            .respond("uname -m", "x86_64\n")
            .fail_connection("docker --version");
        let result = HardwareDetector::detect(&exec).await;
        assert!(matches!(result, Err(ExecError::Connection(_))));
    }

    #[test]
    fn test_parsers() {
        assert_eq!(
            parse_nvcc_version("nvcc: NVIDIA (R) Cuda compiler driver\nCuda compilation tools, release 12.2, V12.2.140\n"),
            Some("12.2".to_string())
        );
        assert_eq!(parse_docker_version("podman version 4.9"), None);
        assert!(is_arm("armv7l"));
        assert!(!is_arm("x86_64"));
        assert!(is_strix("AMD Ryzen AI Max+ PRO 395"));
    }
}
