//! Pool peer software
//!
//! Every peer runs the worker agent behind nginx inside docker compose; only
//! the master is allowed to reach it. On the master, only firewall rules are
//! added on top of that: the proxy ports are open to the pool subnet and
//! closed to everyone else. No separate proxy software is installed; the
//! proxy service itself is expected to be part of the agent image.

use std::path::PathBuf;
use std::sync::Arc;

use super::PoolError;
use crate::config::Settings;
use crate::ssh::{ProbePolicy, ShellConnector, SshAuth, SshTarget, probe};

/// Port nginx listens on inside the agent compose setup
pub const AGENT_LISTEN_PORT: u16 = 80;
/// Port the agent is published on at every peer
pub const AGENT_PUBLIC_PORT: u16 = 80;

/// Master ports agents push to, reachable from the subnet only
pub const PROXY_PEER_PORT_TRUSTED: u16 = 444;
pub const PROXY_PEER_PORT_SANDBOX: u16 = 445;
pub const PROXY_PEER_PORT_ES: u16 = 446;

/// Master port the orchestrator reaches the pool through
pub const PROXY_PUBLIC_PORT: u16 = 10443;

pub const PROXY_PEER_PORTS: [u16; 3] = [
    PROXY_PEER_PORT_TRUSTED,
    PROXY_PEER_PORT_SANDBOX,
    PROXY_PEER_PORT_ES,
];

/// Ports a cloud firewall has to let in
pub const INGRESS_PORTS: [u16; 3] = [22, AGENT_PUBLIC_PORT, PROXY_PUBLIC_PORT];

const fn ports_distinct() -> bool {
    let mut i = 0;
    while i < PROXY_PEER_PORTS.len() {
        if PROXY_PEER_PORTS[i] == PROXY_PUBLIC_PORT || PROXY_PEER_PORTS[i] == AGENT_PUBLIC_PORT {
            return false;
        }
        i += 1;
    }
    true
}

const _: () = assert!(ports_distinct(), "port clash on master peer");

const AGENT_DIR: &str = "./remex-agent";

const COMPOSE_FILE: &str = r#"version: '3'
services:
  agent-proxy:
    restart: always
    image: nginx
    volumes:
      - ./config/nginx/nginx.conf:/etc/nginx/nginx.conf:ro
    ports:
      - {public}:{listen}
    depends_on:
      - agent

  agent:
    restart: always
    build:
      context: ./
      dockerfile: ./Dockerfile
      network: host
    volumes:
      - ./data:/opt/remex-agent/data
      - ./files:/opt/remex-agent/files
      - ./config/default.yml:/opt/remex-agent/config/default.yml"#;

fn compose_file() -> String {
    COMPOSE_FILE
        .replace("{public}", &AGENT_PUBLIC_PORT.to_string())
        .replace("{listen}", &AGENT_LISTEN_PORT.to_string())
}

/// Agent configuration pointing every push at the master's proxy
pub fn agent_config(master_private_ip: &str) -> String {
    format!(
        r#"orchestrator:
  trustedIPOrName: {master}
  trustedAuthPort: {trusted}
  sandboxIPOrName: {master}
  sandboxPort: {sandbox}
  es:
    host: {master}
    port: {es}
  useLocalCA: true
  CACert: ./cert/ca.cert
  venvCmd: 'python3 -m venv'

jobRunner:
  useCertificates: false
  serverCert:
    certPath: ./cert/agent.cert
    keyPath: ./cert/agent.pem
  clientCert:
    certPath: ./cert/agent.cert
    keyPath: ./cert/agent.pem
  port: 8080
  machineId: 0
  maxJobOutput: 1000000
  workCheckInterval: 5
  printLimitReachedMessage: true
  messagePush:
    maxRetryCount: 0
    retryInterval: 1
    pushDestination: "/rest/remote""#,
        master = master_private_ip,
        trusted = PROXY_PEER_PORT_TRUSTED,
        sandbox = PROXY_PEER_PORT_SANDBOX,
        es = PROXY_PEER_PORT_ES,
    )
}

pub fn nginx_config(peer_private_ip: &str) -> String {
    format!(
        r#"events {{
}}

http {{
server {{
   listen {listen};
   server_name {peer};

   location / {{
        proxy_pass http://agent:8080;
        proxy_set_header        Host $host;
        proxy_set_header        X-Real-IP $remote_addr;
        proxy_set_header        X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header        X-Forwarded-Proto $scheme;
   }}
}}
}}"#,
        listen = AGENT_LISTEN_PORT,
        peer = peer_private_ip,
    )
}

/// Write a file in the agent checkout; the delimiter is quoted so that nginx
/// variables are not expanded by the shell
fn write_in_agent(relative: &str, contents: &str) -> String {
    format!(
        "cd {} && cat > {} << 'HEREDOC_EOF'\n{}\nHEREDOC_EOF",
        AGENT_DIR, relative, contents
    )
}

/// Commands installing the worker agent on one peer
pub fn agent_commands(
    repo: &str,
    commit: &str,
    master_private_ip: &str,
    peer_private_ip: &str,
) -> Vec<String> {
    vec![
        format!(
            "sudo iptables -I DOCKER-USER -i ens3 -p tcp --dport {} ! -s {} -j DROP",
            AGENT_LISTEN_PORT, master_private_ip
        ),
        format!("git clone {} {}", repo, AGENT_DIR),
        format!("cd {} && git checkout {}", AGENT_DIR, commit),
        write_in_agent("./config/default.yml", &agent_config(master_private_ip)),
        write_in_agent("./config/nginx/nginx.conf", &nginx_config(peer_private_ip)),
        write_in_agent("./docker-compose.yml", &compose_file()),
        format!("cd {} && sudo docker-compose up -d --build", AGENT_DIR),
    ]
}

/// Commands configuring the proxy firewall on the master
pub fn proxy_commands(subnet_mask: &str) -> Vec<String> {
    let mut commands: Vec<String> = PROXY_PEER_PORTS
        .iter()
        .map(|port| {
            format!(
                "sudo iptables -I DOCKER-USER -i ens3 -p tcp --dport {} ! -s {} -j DROP",
                port, subnet_mask
            )
        })
        .collect();
    // inserted last so it ends up topmost
    commands.push(format!(
        "sudo iptables -I DOCKER-USER -i ens3 -p tcp --dport {} -j RETURN",
        PROXY_PUBLIC_PORT
    ));
    commands
}

/// Commands removing the agent from a peer
pub fn teardown_commands() -> Vec<String> {
    vec![
        format!("cd {} && sudo docker-compose down", AGENT_DIR),
        format!("rm -rf {}", AGENT_DIR),
    ]
}

/// One peer to install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub host: String,
    pub ssh_port: u16,
    pub user: String,
    pub private_ip: String,
}

/// Installs pool software over SSH
#[derive(Clone)]
pub struct PeerBootstrap {
    connector: Arc<dyn ShellConnector>,
    ssh_key: Option<PathBuf>,
    agent_repo: String,
    agent_commit: String,
    probe_policy: ProbePolicy,
}

impl PeerBootstrap {
    pub fn new(connector: Arc<dyn ShellConnector>, settings: &Settings) -> Self {
        Self {
            connector,
            ssh_key: settings.ssh_key_path.clone(),
            agent_repo: settings.agent_repo.clone(),
            agent_commit: settings.agent_commit.clone(),
            probe_policy: ProbePolicy::default(),
        }
    }

    pub fn with_probe_policy(mut self, policy: ProbePolicy) -> Self {
        self.probe_policy = policy;
        self
    }

    fn target(&self, peer: &PeerSpec) -> Result<SshTarget, PoolError> {
        let key = self.ssh_key.clone().ok_or_else(|| {
            PoolError::Parameters("no SSH key configured for pool peers".to_string())
        })?;
        Ok(SshTarget::new(&peer.host, peer.ssh_port, &peer.user, SshAuth::Key(key)))
    }

    async fn run_all(&self, peer: &PeerSpec, commands: &[String]) -> Result<(), PoolError> {
        let target = self.target(peer)?;
        probe(self.connector.as_ref(), &target, self.probe_policy).await?;

        let shell = self.connector.connect(&target).await?;
        let mut result = Ok(());
        for command in commands {
            if let Err(err) = shell.execute(command).await {
                result = Err(PoolError::from(err));
                break;
            }
        }
        let _ = shell.end().await;
        result
    }

    /// Install the agent on `peer`, plus the proxy firewall rules when
    /// `master_subnet` is set
    pub async fn install(
        &self,
        peer: &PeerSpec,
        master_private_ip: &str,
        master_subnet: Option<&str>,
    ) -> Result<(), PoolError> {
        tracing::info!("Installing pool software on {}", peer.host);
        let mut commands = agent_commands(
            &self.agent_repo,
            &self.agent_commit,
            master_private_ip,
            &peer.private_ip,
        );
        if let Some(subnet_mask) = master_subnet {
            commands.extend(proxy_commands(subnet_mask));
        }
        self.run_all(peer, &commands).await
    }

    pub async fn uninstall(&self, peer: &PeerSpec) -> Result<(), PoolError> {
        tracing::info!("Removing pool software from {}", peer.host);
        self.run_all(peer, &teardown_commands()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::fake::{FakeConnector, ScriptedShell};
    use std::time::Duration;

    fn settings() -> Settings {
        Settings {
            ssh_key_path: Some(PathBuf::from("/keys/pool")),
            agent_repo: "https://example.org/agent.git".into(),
            agent_commit: "abc123".into(),
            ..Settings::default()
        }
    }

    fn peer() -> PeerSpec {
        PeerSpec {
            host: "203.0.113.5".into(),
            ssh_port: 22,
            user: "opc".into(),
            private_ip: "11.0.2.10".into(),
        }
    }

    #[test]
    fn test_agent_commands_restrict_to_master() {
        let commands = agent_commands("repo.git", "c0ffee", "11.0.2.2", "11.0.2.10");
        assert_eq!(commands.len(), 7);
        assert!(commands[0].contains("--dport 80 ! -s 11.0.2.2 -j DROP"));
        assert_eq!(commands[1], "git clone repo.git ./remex-agent");
        assert!(commands[2].ends_with("git checkout c0ffee"));
        assert!(commands[3].contains("trustedIPOrName: 11.0.2.2"));
        assert!(commands[3].contains("port: 446"));
        assert!(commands[4].contains("server_name 11.0.2.10;"));
        assert!(commands[4].contains("<< 'HEREDOC_EOF'"));
        assert!(commands[5].contains("- 80:80"));
        assert!(commands[6].ends_with("docker-compose up -d --build"));
    }

    #[test]
    fn test_proxy_public_port_rule_is_last() {
        let commands = proxy_commands("11.0.2.0/24");
        assert_eq!(commands.len(), 4);
        for (command, port) in commands.iter().zip(PROXY_PEER_PORTS) {
            assert!(command.contains(&format!("--dport {} ! -s 11.0.2.0/24 -j DROP", port)));
        }
        assert!(commands[3].contains("--dport 10443 -j RETURN"));
    }

    #[tokio::test]
    async fn test_install_master_runs_proxy_commands() {
        let shell = ScriptedShell::new();
        let bootstrap = PeerBootstrap::new(Arc::new(FakeConnector::new(shell.clone())), &settings());

        bootstrap
            .install(&peer(), "11.0.2.10", Some("11.0.2.0/24"))
            .await
            .unwrap();

        assert_eq!(shell.matching("git clone https://example.org/agent.git").len(), 1);
        assert_eq!(shell.matching("-j RETURN").len(), 1);
        assert!(shell.is_ended());
    }

    #[tokio::test]
    async fn test_install_stops_on_failure() {
        let shell = ScriptedShell::new();
        shell.fail_on("git checkout", 128, "unknown revision");
        let bootstrap = PeerBootstrap::new(Arc::new(FakeConnector::new(shell.clone())), &settings());

        let err = bootstrap.install(&peer(), "11.0.2.2", None).await.unwrap_err();

        assert!(matches!(err, PoolError::Ssh(_)));
        assert!(shell.matching("docker-compose up").is_empty());
        assert!(shell.is_ended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_peer() {
        let bootstrap = PeerBootstrap::new(Arc::new(FakeConnector::refusing()), &settings())
            .with_probe_policy(ProbePolicy {
                attempts: 2,
                cooldown: Duration::from_secs(1),
                deadline: Duration::from_secs(10),
            });

        let err = bootstrap.install(&peer(), "11.0.2.2", None).await.unwrap_err();
        assert!(matches!(err, PoolError::Ssh(_)));
    }

    #[tokio::test]
    async fn test_requires_ssh_key() {
        let bootstrap = PeerBootstrap::new(
            Arc::new(FakeConnector::new(ScriptedShell::new())),
            &Settings::default(),
        );
        let err = bootstrap.install(&peer(), "11.0.2.2", None).await.unwrap_err();
        assert!(matches!(err, PoolError::Parameters(_)));
    }
}
