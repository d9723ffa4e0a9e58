//! Typed resource amounts and Kubernetes quantity-string parsing.
//!
//! CPU is stored in millicores, everything else in base units (bytes for
//! memory-like resources). The set of tracked resources is closed: the four
//! standard kinds plus the custom `gpu-count` / `gpu-mem` pair.

use std::fmt;

use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::SimonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Cpu,
    Memory,
    EphemeralStorage,
    GpuCount,
    GpuMemory,
}

impl ResourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::EphemeralStorage => "ephemeral-storage",
            ResourceKind::GpuCount => "gpu-count",
            ResourceKind::GpuMemory => "gpu-mem",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A Kubernetes-style quantity as it appears in YAML: either a bare number
/// or a suffixed string such as `"1500m"` or `"16Gi"`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Quantity {
    Int(i64),
    Float(f64),
    Str(String),
}

fn split_quantity(s: &str) -> Result<(f64, &str), SimonError> {
    let trimmed = s.trim();
    let split = trimmed
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+'))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    let (num, suffix) = trimmed.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| SimonError::InvalidInput(format!("invalid quantity {:?}", s)))?;
    Ok((value, suffix))
}

/// Parses a CPU quantity into millicores: `"8"` → 8000, `"1500m"` → 1500.
pub fn parse_cpu_milli(q: &Quantity) -> Result<i64, SimonError> {
    match q {
        Quantity::Int(n) => Ok(n * 1000),
        Quantity::Float(f) => Ok((f * 1000.0).round() as i64),
        Quantity::Str(s) => {
            let (value, suffix) = split_quantity(s)?;
            match suffix {
                "" => Ok((value * 1000.0).round() as i64),
                "m" => Ok(value.round() as i64),
                _ => Err(SimonError::InvalidInput(format!(
                    "invalid cpu quantity {:?}",
                    s
                ))),
            }
        }
    }
}

/// Parses a memory-like quantity into base units: `"16Gi"`, `"100Mi"`, `"1G"`.
pub fn parse_bytes(q: &Quantity) -> Result<i64, SimonError> {
    match q {
        Quantity::Int(n) => Ok(*n),
        Quantity::Float(f) => Ok(f.round() as i64),
        Quantity::Str(s) => {
            let (value, suffix) = split_quantity(s)?;
            let factor: f64 = match suffix {
                "" => 1.0,
                "Ki" => 1024.0,
                "Mi" => 1024.0 * 1024.0,
                "Gi" => 1024.0 * 1024.0 * 1024.0,
                "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
                "k" | "K" => 1e3,
                "M" => 1e6,
                "G" => 1e9,
                "T" => 1e12,
                _ => {
                    return Err(SimonError::InvalidInput(format!(
                        "invalid quantity suffix {:?}",
                        s
                    )))
                }
            };
            Ok((value * factor).round() as i64)
        }
    }
}

/// Parses a unitless count such as a GPU count.
pub fn parse_count(q: &Quantity) -> Result<i64, SimonError> {
    parse_bytes(q)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RuntimeResources {
    /// millicores
    pub cpu: i64,
    /// bytes
    pub memory: i64,
    /// bytes
    pub ephemeral_storage: i64,
    pub gpu_count: i64,
    /// bytes; total GPU memory on nodes, total requested memory on pods
    pub gpu_memory: i64,
}

#[derive(Debug, Default, Deserialize)]
struct RawResources {
    cpu: Option<Quantity>,
    memory: Option<Quantity>,
    #[serde(rename = "ephemeral-storage")]
    ephemeral_storage: Option<Quantity>,
    #[serde(rename = "gpu-count")]
    gpu_count: Option<Quantity>,
    #[serde(rename = "gpu-mem", alias = "gpu-mem-total")]
    gpu_memory: Option<Quantity>,
}

impl<'de> Deserialize<'de> for RuntimeResources {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawResources::deserialize(deserializer)?;
        let parse = |q: &Option<Quantity>, f: fn(&Quantity) -> Result<i64, SimonError>| match q {
            Some(q) => f(q).map_err(D::Error::custom),
            None => Ok(0),
        };
        Ok(RuntimeResources {
            cpu: parse(&raw.cpu, parse_cpu_milli)?,
            memory: parse(&raw.memory, parse_bytes)?,
            ephemeral_storage: parse(&raw.ephemeral_storage, parse_bytes)?,
            gpu_count: parse(&raw.gpu_count, parse_count)?,
            gpu_memory: parse(&raw.gpu_memory, parse_bytes)?,
        })
    }
}

impl RuntimeResources {
    pub fn iter(&self) -> [(ResourceKind, i64); 5] {
        [
            (ResourceKind::Cpu, self.cpu),
            (ResourceKind::Memory, self.memory),
            (ResourceKind::EphemeralStorage, self.ephemeral_storage),
            (ResourceKind::GpuCount, self.gpu_count),
            (ResourceKind::GpuMemory, self.gpu_memory),
        ]
    }

    pub fn get(&self, kind: ResourceKind) -> i64 {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
            ResourceKind::EphemeralStorage => self.ephemeral_storage,
            ResourceKind::GpuCount => self.gpu_count,
            ResourceKind::GpuMemory => self.gpu_memory,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.iter().iter().all(|(_, v)| *v == 0)
    }

    pub fn add(&mut self, other: &RuntimeResources) {
        self.cpu += other.cpu;
        self.memory += other.memory;
        self.ephemeral_storage += other.ephemeral_storage;
        self.gpu_count += other.gpu_count;
        self.gpu_memory += other.gpu_memory;
    }

    pub fn sub(&mut self, other: &RuntimeResources) {
        self.cpu -= other.cpu;
        self.memory -= other.memory;
        self.ephemeral_storage -= other.ephemeral_storage;
        self.gpu_count -= other.gpu_count;
        self.gpu_memory -= other.gpu_memory;
    }

    /// Returns the first resource for which `self` does not fit into `avail`.
    pub fn first_insufficient(&self, avail: &RuntimeResources) -> Option<ResourceKind> {
        self.iter()
            .iter()
            .find(|(kind, requested)| *requested > 0 && *requested > avail.get(*kind))
            .map(|(kind, _)| *kind)
    }

    pub fn has_negative(&self) -> bool {
        self.iter().iter().any(|(_, v)| *v < 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Quantity {
        Quantity::Str(v.to_string())
    }

    #[test]
    fn test_parse_cpu_quantities() {
        assert_eq!(8000, parse_cpu_milli(&Quantity::Int(8)).unwrap());
        assert_eq!(1500, parse_cpu_milli(&s("1500m")).unwrap());
        assert_eq!(8000, parse_cpu_milli(&s("8")).unwrap());
        assert_eq!(500, parse_cpu_milli(&s("0.5")).unwrap());
        assert!(parse_cpu_milli(&s("8Gi")).is_err());
    }

    #[test]
    fn test_parse_byte_quantities() {
        assert_eq!(16 * 1024 * 1024 * 1024, parse_bytes(&s("16Gi")).unwrap());
        assert_eq!(100 * 1024 * 1024, parse_bytes(&s("100Mi")).unwrap());
        assert_eq!(1_000_000_000, parse_bytes(&s("1G")).unwrap());
        assert_eq!(512, parse_bytes(&Quantity::Int(512)).unwrap());
        assert!(parse_bytes(&s("12Qx")).is_err());
    }

    #[test]
    fn test_deserialize_resource_list() {
        let yaml = r#"
        cpu: "8"
        memory: 16Gi
        gpu-count: 4
        gpu-mem-total: 64Gi
        "#;
        let res: RuntimeResources = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(8000, res.cpu);
        assert_eq!(16 * 1024 * 1024 * 1024, res.memory);
        assert_eq!(4, res.gpu_count);
        assert_eq!(64 * 1024 * 1024 * 1024, res.gpu_memory);
        assert_eq!(0, res.ephemeral_storage);
    }

    #[test]
    fn test_first_insufficient() {
        let avail = RuntimeResources {
            cpu: 1000,
            memory: 1024,
            ..Default::default()
        };
        let req = RuntimeResources {
            cpu: 2000,
            ..Default::default()
        };
        assert_eq!(Some(ResourceKind::Cpu), req.first_insufficient(&avail));
        let fits = RuntimeResources {
            cpu: 1000,
            memory: 512,
            ..Default::default()
        };
        assert_eq!(None, fits.first_insufficient(&avail));
    }
}
