use async_trait::async_trait;
use std::io;
use tokio::process::Command;
use tracing::debug;

use crate::credentials::KdcDiscovery;

/// Looks up `_kerberos._tcp.<domain>` SRV records with `nslookup`.
#[derive(Debug, Clone)]
pub struct NslookupDiscovery {
    program: String,
}

impl NslookupDiscovery {
    pub fn new() -> Self {
        Self {
            program: "nslookup".to_string(),
        }
    }
}

impl Default for NslookupDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KdcDiscovery for NslookupDiscovery {
    async fn discover(&self, domain: &str) -> io::Result<Vec<String>> {
        let query = format!("_kerberos._tcp.{}", domain);
        let output = Command::new(&self.program)
            .arg("-type=srv")
            .arg(&query)
            .kill_on_drop(true)
            .output()
            .await?;

        // nslookup exits non-zero for NXDOMAIN; that is "none found"
        let stdout = String::from_utf8_lossy(&output.stdout);
        let kdcs = parse_srv_output(&stdout);
        debug!(%query, status = %output.status, found = kdcs.len(), "SRV lookup finished");
        Ok(kdcs)
    }
}

/// Host names from `nslookup -type=srv` output, in answer order and without
/// duplicates. Understands both the Unix one-line form
/// (`... service = 0 100 88 kdc1.example.com.`) and the Windows block form
/// (`svr hostname = kdc1.example.com`).
pub fn parse_srv_output(output: &str) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        let host = if let Some((_, record)) = line.split_once("service =") {
            record
                .split_whitespace()
                .rev()
                .find(|token| token.parse::<u64>().is_err())
        } else if line.starts_with("svr hostname") {
            line.split_once('=').map(|(_, host)| host.trim())
        } else {
            None
        };

        if let Some(host) = host.map(|h| h.trim_end_matches('.')).filter(|h| !h.is_empty()) {
            if !hosts.iter().any(|known| known.eq_ignore_ascii_case(host)) {
                hosts.push(host.to_string());
            }
        }
    }
    hosts
}
