//! The JSON Patch applied to every eligible Pod.
//!
//! The patch never depends on the request: it is built once from a
//! [`ProxyBlueprint`] at startup and shared read-only afterwards. The
//! redirect rules in the init container and the ports declared on the sidecar
//! are both generated from [`SidecarBlueprint::ports`], so they cannot drift
//! apart.

use std::{collections::HashSet, fmt};

use base64::{prelude::BASE64_STANDARD, Engine};
use json_patch::{AddOperation, PatchOperation};
use k8s_openapi::api::core::v1::{Capabilities, Container, ContainerPort, EnvVar, SecurityContext};

use crate::{eligibility::SIDECAR_MARKER, Error};

/// Bumped whenever the generated patch changes shape.
pub const PATCH_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Name as Kubernetes spells it in `ContainerPort.protocol`.
    pub fn as_k8s(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }

    /// Name as iptables spells it in `-p`.
    pub fn as_iptables(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_k8s())
    }
}

/// Inbound traffic of `protocol` is redirected to `port` on the sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectPort {
    pub port: u16,
    pub protocol: Protocol,
}

impl RedirectPort {
    fn iptables_rule(&self) -> String {
        format!(
            "iptables -t nat -A PREROUTING -p {} -j REDIRECT --to-port {}",
            self.protocol.as_iptables(),
            self.port
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitBlueprint {
    pub name: String,
    pub image: String,
    pub capability: String,
    /// Commands run before the redirect rules are installed.
    pub prelude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarBlueprint {
    pub name: String,
    pub image: String,
    pub ports: Vec<RedirectPort>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyBlueprint {
    pub init: InitBlueprint,
    pub sidecar: SidecarBlueprint,
}

impl Default for ProxyBlueprint {
    fn default() -> Self {
        ProxyBlueprint {
            init: InitBlueprint {
                name: "proxy-init".to_string(),
                image: "ubuntu:latest".to_string(),
                capability: "NET_ADMIN".to_string(),
                prelude: vec![
                    "apt-get update".to_string(),
                    "apt-get install -y iptables".to_string(),
                ],
            },
            sidecar: SidecarBlueprint {
                name: "cortexflow-proxy-sidecar".to_string(),
                image: "lorenzotettamanti/cortexflow-proxy:latest".to_string(),
                ports: vec![
                    RedirectPort {
                        port: 5054,
                        protocol: Protocol::Tcp,
                    },
                    RedirectPort {
                        port: 5053,
                        protocol: Protocol::Udp,
                    },
                ],
            },
        }
    }
}

impl ProxyBlueprint {
    fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: String| Err(Error::BlueprintError(msg));

        for (what, value) in [
            ("init container name", &self.init.name),
            ("init container image", &self.init.image),
            ("init container capability", &self.init.capability),
            ("sidecar name", &self.sidecar.name),
            ("sidecar image", &self.sidecar.image),
        ] {
            if value.trim().is_empty() {
                return invalid(format!("{what} must not be empty"));
            }
        }
        if !self.sidecar.name.contains(SIDECAR_MARKER) {
            return invalid(format!(
                "sidecar name '{}' must contain '{SIDECAR_MARKER}'",
                self.sidecar.name
            ));
        }
        if self.sidecar.ports.is_empty() {
            return invalid("sidecar must expose at least one port".to_string());
        }

        // a second REDIRECT for the same protocol would never match
        let mut protocols = HashSet::new();
        for port in &self.sidecar.ports {
            if port.port == 0 {
                return invalid(format!("{} port must not be 0", port.protocol));
            }
            if !protocols.insert(port.protocol) {
                return invalid(format!("more than one {} redirect port", port.protocol));
            }
        }
        Ok(())
    }

    pub fn redirect_command(&self) -> String {
        self.init
            .prelude
            .iter()
            .cloned()
            .chain(self.sidecar.ports.iter().map(RedirectPort::iptables_rule))
            .collect::<Vec<_>>()
            .join(" && ")
    }

    fn init_container(&self) -> Container {
        Container {
            name: self.init.name.clone(),
            image: Some(self.init.image.clone()),
            command: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                self.redirect_command(),
            ]),
            security_context: Some(SecurityContext {
                capabilities: Some(Capabilities {
                    add: Some(vec![self.init.capability.clone()]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn sidecar_container(&self) -> Container {
        Container {
            name: self.sidecar.name.clone(),
            image: Some(self.sidecar.image.clone()),
            ports: Some(
                self.sidecar
                    .ports
                    .iter()
                    .map(|x| ContainerPort {
                        container_port: i32::from(x.port),
                        protocol: Some(x.protocol.as_k8s().to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            env: Some(vec![EnvVar {
                name: "PROXY_PATCH_VERSION".to_string(),
                value: Some(PATCH_VERSION.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }
}

/// Immutable once built.
#[derive(Debug, Clone)]
pub struct PatchDocument {
    patch: json_patch::Patch,
}

impl PatchDocument {
    pub fn build(blueprint: &ProxyBlueprint) -> Result<Self, Error> {
        blueprint.validate()?;

        let init_containers = serde_json::to_value(vec![blueprint.init_container()])?;
        let sidecar = serde_json::to_value(blueprint.sidecar_container())?;

        Ok(PatchDocument {
            patch: json_patch::Patch(vec![
                PatchOperation::Add(AddOperation {
                    path: "/spec/initContainers".to_string(),
                    value: init_containers,
                }),
                PatchOperation::Add(AddOperation {
                    path: "/spec/containers/-".to_string(),
                    value: sidecar,
                }),
            ]),
        })
    }

    pub fn version(&self) -> &'static str {
        PATCH_VERSION
    }

    pub fn patch(&self) -> &json_patch::Patch {
        &self.patch
    }

    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(&self.patch)?)
    }

    /// Canonical JSON, base64-encoded for `AdmissionResponse.patch`.
    pub fn encode(&self) -> Result<String, Error> {
        Ok(BASE64_STANDARD.encode(self.to_json()?))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn decode(encoded: &str) -> json_patch::Patch {
        let raw = BASE64_STANDARD.decode(encoded).unwrap();
        serde_json::from_slice(&raw).unwrap()
    }

    #[test]
    fn default_command() {
        assert_eq!(
            ProxyBlueprint::default().redirect_command(),
            "apt-get update && apt-get install -y iptables && \
iptables -t nat -A PREROUTING -p tcp -j REDIRECT --to-port 5054 && \
iptables -t nat -A PREROUTING -p udp -j REDIRECT --to-port 5053"
        );
    }

    #[test]
    fn two_operations() {
        let doc = PatchDocument::build(&ProxyBlueprint::default()).unwrap();
        let ops = &doc.patch().0;
        assert_eq!(ops.len(), 2);
        match (&ops[0], &ops[1]) {
            (PatchOperation::Add(init), PatchOperation::Add(sidecar)) => {
                assert_eq!(init.path, "/spec/initContainers");
                assert_eq!(sidecar.path, "/spec/containers/-");
                assert_eq!(init.value[0]["name"], "proxy-init");
                assert_eq!(init.value[0]["image"], "ubuntu:latest");
                assert_eq!(
                    init.value[0]["securityContext"]["capabilities"]["add"],
                    json!(["NET_ADMIN"])
                );
                assert_eq!(sidecar.value["name"], "cortexflow-proxy-sidecar");
                assert_eq!(
                    sidecar.value["image"],
                    "lorenzotettamanti/cortexflow-proxy:latest"
                );
            }
            other => panic!("unexpected operations: {other:?}"),
        }
    }

    #[test]
    fn applies_to_minimal_pod() {
        let doc = PatchDocument::build(&ProxyBlueprint::default()).unwrap();
        let patch = decode(&doc.encode().unwrap());

        let mut pod = json!({"spec": {"containers": []}});
        json_patch::patch(&mut pod, &patch).unwrap();

        let init = pod["spec"]["initContainers"].as_array().unwrap();
        assert_eq!(init.len(), 1);
        let containers = pod["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 1);

        let ports: Vec<(i64, &str)> = containers[0]["ports"]
            .as_array()
            .unwrap()
            .iter()
            .map(|x| {
                (
                    x["containerPort"].as_i64().unwrap(),
                    x["protocol"].as_str().unwrap(),
                )
            })
            .collect();
        assert_eq!(ports, vec![(5054, "TCP"), (5053, "UDP")]);
    }

    #[test]
    fn appends_after_existing_containers() {
        let doc = PatchDocument::build(&ProxyBlueprint::default()).unwrap();
        let mut pod = json!({"spec": {"containers": [{"name": "app"}]}});
        json_patch::patch(&mut pod, doc.patch()).unwrap();
        let containers = pod["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers[0]["name"], "app");
        assert_eq!(containers[1]["name"], "cortexflow-proxy-sidecar");
    }

    #[test]
    fn ports_and_rules_stay_coupled() {
        let mut blueprint = ProxyBlueprint::default();
        blueprint.sidecar.ports = vec![
            RedirectPort {
                port: 15001,
                protocol: Protocol::Tcp,
            },
            RedirectPort {
                port: 15053,
                protocol: Protocol::Udp,
            },
        ];
        let doc = PatchDocument::build(&blueprint).unwrap();
        let PatchOperation::Add(init) = &doc.patch().0[0] else {
            panic!("expected add");
        };
        let PatchOperation::Add(sidecar) = &doc.patch().0[1] else {
            panic!("expected add");
        };

        let command = init.value[0]["command"][2].as_str().unwrap();
        for port in sidecar.value["ports"].as_array().unwrap() {
            let protocol = port["protocol"].as_str().unwrap().to_ascii_lowercase();
            let number = port["containerPort"].as_i64().unwrap();
            assert!(command.contains(&format!("-p {protocol} -j REDIRECT --to-port {number}")));
        }
        assert!(!command.contains("5054"));
    }

    #[test]
    fn encoding_is_stable() {
        let doc = PatchDocument::build(&ProxyBlueprint::default()).unwrap();
        assert_eq!(doc.encode().unwrap(), doc.encode().unwrap());
        let raw: Value = serde_json::from_slice(&doc.to_json().unwrap()).unwrap();
        assert_eq!(raw[0]["op"], "add");
        assert_eq!(raw[1]["op"], "add");
        assert_eq!(
            raw[1]["value"]["env"],
            json!([{"name": "PROXY_PATCH_VERSION", "value": "v1"}])
        );
    }

    #[test]
    fn rejects_bad_blueprints() {
        let check = |f: fn(&mut ProxyBlueprint)| {
            let mut blueprint = ProxyBlueprint::default();
            f(&mut blueprint);
            matches!(
                PatchDocument::build(&blueprint),
                Err(Error::BlueprintError(_))
            )
        };
        assert!(check(|x| x.sidecar.image.clear()));
        assert!(check(|x| x.init.image = " ".to_string()));
        assert!(check(|x| x.sidecar.name = "proxy".to_string()));
        assert!(check(|x| x.sidecar.ports.clear()));
        assert!(check(|x| x.sidecar.ports[0].port = 0));
        assert!(check(|x| x.sidecar.ports[1].protocol = Protocol::Tcp));
        assert!(!check(|_| {}));
    }
}
