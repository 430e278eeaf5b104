//! 服务注册表
//!
//! 内置服务目录，以及：
//! - 依赖图校验（环、缺失依赖）
//! - 模式/平台兼容性解析
//! - 平台兼容性报告

use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::hardware::HardwareVariant;
use crate::domain::service::{
    BinaryLaunchSpec, ContainerLaunchSpec, DeploymentMode, GpuOverlay, HealthCheckSpec,
    ManualSpec, ModeSupport, Platform, PortBinding, ResolvedService, ServiceDefinition,
    ServiceType, VolumeMount,
};
use crate::domain::system::{HostInfo, PlatformCompatibility, ServiceCompatibility};
use crate::error::ErrorCode;

/// 注册表错误
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("service {service} depends on {dependency}, which is not enabled")]
    MissingDependency { service: String, dependency: String },

    #[error("critical service {service} has no deployment mode supported on {platform}")]
    NoSupportedMode { service: String, platform: Platform },

    #[error("invalid service configuration: {}", join_errors(.0))]
    Invalid(Vec<RegistryError>),
}

fn join_errors(errors: &[RegistryError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ErrorCode for RegistryError {
    fn code(&self) -> &'static str {
        match self {
            RegistryError::UnknownService(_) => "unknown_service",
            RegistryError::Cycle(_) => "dependency_cycle",
            RegistryError::MissingDependency { .. } => "missing_dependency",
            RegistryError::NoSupportedMode { .. } => "no_supported_mode",
            RegistryError::Invalid(_) => "invalid_configuration",
        }
    }
}

/// 服务注册表（只读）
#[derive(Clone, Debug)]
pub struct ServiceRegistry {
    services: Vec<ServiceDefinition>,
}

impl ServiceRegistry {
    pub fn new(services: Vec<ServiceDefinition>) -> Self {
        Self { services }
    }

    /// 内置服务目录
    pub fn builtin() -> Self {
        Self::new(builtin_services())
    }

    pub fn all(&self) -> &[ServiceDefinition] {
        &self.services
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.name == name)
    }

    /// 启用的服务：关键服务总是启用，可选服务需在 features 中选中
    pub fn resolve_enabled_services(&self, features: &[String]) -> Vec<ServiceDefinition> {
        self.services
            .iter()
            .filter(|s| s.critical || features.iter().any(|f| f == &s.name))
            .cloned()
            .collect()
    }

    /// 服务声明了该模式，且平台在该模式的平台列表中
    pub fn is_mode_supported(&self, service: &str, mode: DeploymentMode, platform: Platform) -> bool {
        self.get(service)
            .and_then(|s| s.mode_support(mode))
            .map_or(false, |m| m.allows(platform))
    }

    /// 平台上可用的模式，保持声明顺序
    pub fn supported_modes(&self, service: &str, platform: Platform) -> Vec<DeploymentMode> {
        self.get(service)
            .map(|s| supported_modes_of(s, platform))
            .unwrap_or_default()
    }

    /// 为启用的服务分配部署模式
    ///
    /// 首选模式可用则使用，否则取第一个可用模式；可选服务没有可用模式时被排除，
    /// 关键服务没有可用模式时返回错误。
    pub fn resolve_compatible_services(
        &self,
        features: &[String],
        preferred_mode: Option<DeploymentMode>,
        platform: Platform,
    ) -> Result<Vec<ResolvedService>, RegistryError> {
        let enabled = self.resolve_enabled_services(features);

        let graph_errors = validate(&enabled);
        if !graph_errors.is_empty() {
            return Err(RegistryError::Invalid(graph_errors));
        }

        let mut errors = Vec::new();
        let mut resolved = Vec::new();
        for service in enabled {
            let modes = supported_modes_of(&service, platform);
            let assigned = match preferred_mode {
                Some(mode) if modes.contains(&mode) => Some(mode),
                _ => modes.first().copied(),
            };
            match assigned {
                Some(mode) => resolved.push(ResolvedService {
                    definition: service,
                    assigned_mode: mode,
                }),
                None if service.critical => errors.push(RegistryError::NoSupportedMode {
                    service: service.name.clone(),
                    platform,
                }),
                None => {
                    debug!(service = %service.name, platform = %platform, "No supported mode, excluded");
                }
            }
        }
        if !errors.is_empty() {
            return Err(RegistryError::Invalid(errors));
        }

        // 依赖被排除的可选服务也要排除
        loop {
            let present: HashSet<String> =
                resolved.iter().map(|r| r.definition.name.clone()).collect();
            let before = resolved.len();
            let mut dropped_critical = Vec::new();
            resolved.retain(|r| {
                let missing = r
                    .definition
                    .dependencies
                    .iter()
                    .find(|d| !present.contains(*d));
                match missing {
                    Some(dep) if r.definition.critical => {
                        dropped_critical.push(RegistryError::MissingDependency {
                            service: r.definition.name.clone(),
                            dependency: dep.clone(),
                        });
                        true
                    }
                    Some(dep) => {
                        warn!(service = %r.definition.name, dependency = %dep, "Dependency excluded on this platform, excluding service");
                        false
                    }
                    None => true,
                }
            });
            if !dropped_critical.is_empty() {
                return Err(RegistryError::Invalid(dropped_critical));
            }
            if resolved.len() == before {
                break;
            }
        }

        Ok(startup_order(resolved))
    }

    /// 当前平台的兼容性报告
    pub fn compatibility_report(&self, host: HostInfo) -> PlatformCompatibility {
        let platform = host.platform;
        let services = self
            .services
            .iter()
            .map(|s| {
                let supported_modes = supported_modes_of(s, platform);
                ServiceCompatibility {
                    name: s.name.clone(),
                    critical: s.critical,
                    default_mode: supported_modes.first().copied(),
                    supported_modes,
                    binary_path: s
                        .binary
                        .as_ref()
                        .map(|b| b.resolve_path(platform, &host.cpu_arch)),
                }
            })
            .collect();
        PlatformCompatibility { host, services }
    }
}

fn supported_modes_of(service: &ServiceDefinition, platform: Platform) -> Vec<DeploymentMode> {
    service
        .modes
        .iter()
        .filter(|m| m.allows(platform))
        .map(|m| m.mode)
        .collect()
}

/// 按优先级、名称排序（调用方调度器的建议启动顺序）
pub fn startup_order(mut services: Vec<ResolvedService>) -> Vec<ResolvedService> {
    services.sort_by(|a, b| {
        a.definition
            .priority
            .cmp(&b.definition.priority)
            .then_with(|| a.definition.name.cmp(&b.definition.name))
    });
    services
}

/// 校验依赖图：收集所有环与缺失依赖，不提前返回
pub fn validate(services: &[ServiceDefinition]) -> Vec<RegistryError> {
    let index: BTreeMap<&str, &ServiceDefinition> =
        services.iter().map(|s| (s.name.as_str(), s)).collect();
    let mut errors = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = Vec::new();

    for service in services {
        visit(service.name.as_str(), &index, &mut visited, &mut stack, &mut errors);
    }
    errors
}

fn visit<'a>(
    name: &'a str,
    index: &BTreeMap<&'a str, &'a ServiceDefinition>,
    visited: &mut HashSet<&'a str>,
    stack: &mut Vec<&'a str>,
    errors: &mut Vec<RegistryError>,
) {
    if let Some(pos) = stack.iter().position(|n| *n == name) {
        let mut cycle: Vec<String> = stack[pos..].iter().map(|s| s.to_string()).collect();
        cycle.push(name.to_string());
        errors.push(RegistryError::Cycle(cycle));
        return;
    }
    if !visited.insert(name) {
        return;
    }
    let Some(&service) = index.get(name) else {
        return;
    };

    stack.push(name);
    for dep in &service.dependencies {
        if index.contains_key(dep.as_str()) {
            visit(dep.as_str(), index, visited, stack, errors);
        } else {
            errors.push(RegistryError::MissingDependency {
                service: name.to_string(),
                dependency: dep.clone(),
            });
        }
    }
    stack.pop();
}

fn volume(source: &str, target: &str) -> VolumeMount {
    VolumeMount {
        source: source.to_string(),
        target: target.to_string(),
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn dri_overlay() -> GpuOverlay {
    GpuOverlay {
        devices: strings(&["/dev/dri"]),
        group_add: strings(&["video", "render"]),
        ..Default::default()
    }
}

fn cuda_overlay() -> GpuOverlay {
    let mut env = BTreeMap::new();
    env.insert("NVIDIA_VISIBLE_DEVICES".to_string(), "all".to_string());
    env.insert(
        "NVIDIA_DRIVER_CAPABILITIES".to_string(),
        "compute,utility".to_string(),
    );
    GpuOverlay {
        gpus: Some("all".to_string()),
        env,
        ..Default::default()
    }
}

/// claracore 各硬件变体的 GPU 配置
pub fn claracore_overlays() -> BTreeMap<HardwareVariant, GpuOverlay> {
    let mut overlays = BTreeMap::new();
    overlays.insert(HardwareVariant::Cuda, cuda_overlay());
    overlays.insert(
        HardwareVariant::Rocm,
        GpuOverlay {
            devices: strings(&["/dev/kfd", "/dev/dri"]),
            group_add: strings(&["video", "render"]),
            security_opts: strings(&["seccomp=unconfined"]),
            cap_add: strings(&["SYS_PTRACE"]),
            ..Default::default()
        },
    );
    overlays.insert(HardwareVariant::Strix, dri_overlay());
    overlays.insert(HardwareVariant::Vulkan, dri_overlay());
    overlays
}

fn builtin_services() -> Vec<ServiceDefinition> {
    use DeploymentMode::{Docker, Local, Manual, Remote};
    use Platform::{Linux, Win32};

    let mut comfyui_overlays = BTreeMap::new();
    comfyui_overlays.insert(HardwareVariant::Cuda, cuda_overlay());

    let mut n8n_env = BTreeMap::new();
    n8n_env.insert("N8N_PORT".to_string(), "5678".to_string());

    vec![
        ServiceDefinition {
            name: "claracore".to_string(),
            service_type: ServiceType::Binary,
            critical: true,
            auto_restart: true,
            priority: 1,
            dependencies: vec![],
            port: Some(8091),
            modes: vec![
                ModeSupport::everywhere(Local),
                ModeSupport::only(Docker, &[Win32, Linux]),
                ModeSupport::everywhere(Remote),
            ],
            container: Some(ContainerLaunchSpec {
                container_name: "clara_core".to_string(),
                image_template: "clara17verse/claracore:{variant}".to_string(),
                ports: vec![PortBinding {
                    host: 8091,
                    container: 5890,
                }],
                volumes: vec![volume("clara_core_models", "/app/models")],
                env: BTreeMap::new(),
                host_network_platforms: vec![],
                overlays: claracore_overlays(),
                preempt_port: Some(8091),
                preempt_allowlist: strings(&["claracore", "llama-server", "llama-swap"]),
            }),
            binary: Some(BinaryLaunchSpec {
                path_template: "claracore/claracore-{platform}-{arch}{ext}".to_string(),
                args: strings(&["--listen", ":8091"]),
            }),
            manual: Some(ManualSpec {
                requires_url: true,
                health_path: "/health".to_string(),
                config_key: "claracore_remote_url".to_string(),
            }),
            health: HealthCheckSpec {
                path: "/health".to_string(),
                timeout: None,
            },
        },
        ServiceDefinition {
            name: "mcp-proxy".to_string(),
            service_type: ServiceType::HttpService,
            critical: true,
            auto_restart: true,
            priority: 2,
            dependencies: vec![],
            port: Some(8092),
            modes: vec![ModeSupport::everywhere(Local)],
            container: None,
            binary: None,
            manual: None,
            health: HealthCheckSpec {
                path: "/health".to_string(),
                timeout: None,
            },
        },
        ServiceDefinition {
            name: "python-backend".to_string(),
            service_type: ServiceType::Container,
            critical: false,
            auto_restart: true,
            priority: 3,
            dependencies: vec![],
            port: Some(5001),
            modes: vec![
                ModeSupport::everywhere(Docker),
                ModeSupport::everywhere(Manual),
            ],
            container: Some(ContainerLaunchSpec {
                container_name: "clara_python".to_string(),
                image_template: "clara17verse/clara-backend:latest".to_string(),
                ports: vec![PortBinding {
                    host: 5001,
                    container: 5000,
                }],
                volumes: vec![volume("clara_python_data", "/home/clara")],
                env: BTreeMap::new(),
                host_network_platforms: vec![Linux],
                overlays: BTreeMap::new(),
                preempt_port: None,
                preempt_allowlist: vec![],
            }),
            binary: None,
            manual: Some(ManualSpec {
                requires_url: true,
                health_path: "/health".to_string(),
                config_key: "python_backend_url".to_string(),
            }),
            health: HealthCheckSpec {
                path: "/health".to_string(),
                timeout: None,
            },
        },
        ServiceDefinition {
            name: "comfyui".to_string(),
            service_type: ServiceType::Container,
            critical: false,
            auto_restart: false,
            priority: 4,
            dependencies: vec!["python-backend".to_string()],
            port: Some(8188),
            modes: vec![
                ModeSupport::only(Docker, &[Win32, Linux]),
                ModeSupport::everywhere(Manual),
            ],
            container: Some(ContainerLaunchSpec {
                container_name: "clara_comfyui".to_string(),
                image_template: "clara17verse/clara-comfyui:latest".to_string(),
                ports: vec![PortBinding {
                    host: 8188,
                    container: 8188,
                }],
                volumes: vec![volume("clara_comfyui_models", "/app/ComfyUI/models")],
                env: BTreeMap::new(),
                host_network_platforms: vec![],
                overlays: comfyui_overlays,
                preempt_port: None,
                preempt_allowlist: vec![],
            }),
            binary: None,
            manual: Some(ManualSpec {
                requires_url: true,
                health_path: "/".to_string(),
                config_key: "comfyui_url".to_string(),
            }),
            health: HealthCheckSpec {
                path: "/".to_string(),
                timeout: None,
            },
        },
        ServiceDefinition {
            name: "n8n".to_string(),
            service_type: ServiceType::Container,
            critical: false,
            auto_restart: true,
            priority: 5,
            dependencies: vec![],
            port: Some(5678),
            modes: vec![
                ModeSupport::everywhere(Docker),
                ModeSupport::everywhere(Manual),
            ],
            container: Some(ContainerLaunchSpec {
                container_name: "clara_n8n".to_string(),
                image_template: "n8nio/n8n:latest".to_string(),
                ports: vec![PortBinding {
                    host: 5678,
                    container: 5678,
                }],
                volumes: vec![volume("n8n_data", "/home/node/.n8n")],
                env: n8n_env,
                host_network_platforms: vec![],
                overlays: BTreeMap::new(),
                preempt_port: None,
                preempt_allowlist: vec![],
            }),
            binary: None,
            manual: Some(ManualSpec {
                requires_url: true,
                health_path: "/healthz".to_string(),
                config_key: "n8n_url".to_string(),
            }),
            health: HealthCheckSpec {
                path: "/healthz".to_string(),
                timeout: None,
            },
        },
    ]
}
