//! iSCSI initiator client backed by `iscsiadm`

use super::run_command;
use crate::domain::ports::{IscsiClient, SessionTarget};
use crate::domain::SessionState;
use crate::error::{Error, Result};
use async_trait::async_trait;
use tracing::{debug, info};

/// `iscsiadm` exit status for "no matching sessions"
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

/// `iscsiadm` exit status for "session already exists"
const ISCSI_ERR_SESS_EXISTS: i32 = 15;

const DEFAULT_ISCSI_PORT: &str = "3260";

/// One session reported by `iscsiadm -m session -P 1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiSession {
    pub iqn: String,
    /// `host:port` with the portal group tag stripped
    pub portal: String,
    pub sid: Option<u32>,
    pub session_state: Option<String>,
    pub connection_state: Option<String>,
}

impl IscsiSession {
    pub fn is_logged_in(&self) -> bool {
        self.session_state.as_deref() == Some("LOGGED_IN")
    }
}

/// Parse the print-level-1 session listing
///
/// A target may carry several sessions (one per portal); each `SID` line
/// starts a new one under the most recent `Target` and portal.
pub fn parse_session_listing(output: &str) -> Vec<IscsiSession> {
    let mut sessions: Vec<IscsiSession> = Vec::new();
    let mut iqn: Option<String> = None;
    let mut portal: Option<String> = None;

    for line in output.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Target" => {
                // `iqn.2010-10.org.example:vol-a (non-flash)`
                let name = value.split_whitespace().next().unwrap_or_default();
                iqn = Some(name.to_string());
                portal = None;
            }
            "Current Portal" => {
                portal = Some(strip_portal_group(value));
            }
            "Persistent Portal" if portal.is_none() => {
                portal = Some(strip_portal_group(value));
            }
            "SID" => {
                if let (Some(iqn), Some(portal)) = (&iqn, &portal) {
                    sessions.push(IscsiSession {
                        iqn: iqn.clone(),
                        portal: portal.clone(),
                        sid: value.parse().ok(),
                        session_state: None,
                        connection_state: None,
                    });
                }
            }
            "iSCSI Connection State" => {
                if let Some(session) = sessions.last_mut() {
                    session.connection_state = Some(value.to_string());
                }
            }
            "iSCSI Session State" => {
                if let Some(session) = sessions.last_mut() {
                    session.session_state = Some(value.to_string());
                }
            }
            _ => {}
        }
    }
    sessions
}

/// `10.0.0.5:3260,1` → `10.0.0.5:3260`
fn strip_portal_group(portal: &str) -> String {
    portal
        .split(',')
        .next()
        .unwrap_or(portal)
        .trim()
        .to_string()
}

/// Portals are compared with the default port filled in
fn normalize_portal(portal: &str) -> String {
    let portal = strip_portal_group(portal);
    let has_port = if portal.starts_with('[') {
        portal.contains("]:")
    } else {
        portal.matches(':').count() == 1
    };
    if has_port {
        portal
    } else {
        format!("{}:{}", portal, DEFAULT_ISCSI_PORT)
    }
}

/// Classify `target` against a parsed listing
pub fn classify_session(sessions: &[IscsiSession], target: &SessionTarget) -> SessionState {
    let portal = normalize_portal(&target.target_portal);
    let matching: Vec<&IscsiSession> = sessions
        .iter()
        .filter(|s| s.iqn == target.iqn && normalize_portal(&s.portal) == portal)
        .collect();

    if matching.is_empty() {
        SessionState::Missing
    } else if matching.iter().any(|s| s.is_logged_in()) {
        SessionState::Healthy
    } else {
        SessionState::Stale
    }
}

// =============================================================================
// iscsiadm Client
// =============================================================================

/// Drives the local open-iscsi initiator
pub struct IscsiadmClient {
    binary: String,
}

impl Default for IscsiadmClient {
    fn default() -> Self {
        Self {
            binary: "iscsiadm".to_string(),
        }
    }
}

impl IscsiadmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn sessions(&self) -> Result<Vec<IscsiSession>> {
        let output = run_command(&self.binary, &["-m", "session", "-P", "1"], None).await?;
        if output.code == Some(ISCSI_ERR_NO_OBJS_FOUND) {
            return Ok(Vec::new());
        }
        if !output.success() {
            return Err(Error::Iscsi {
                target: "*".into(),
                reason: format!("session listing failed: {}", output.stderr.trim()),
            });
        }
        Ok(parse_session_listing(&output.stdout))
    }

    async fn node_command(&self, target: &SessionTarget, action: &[&str]) -> Result<Option<i32>> {
        let portal = normalize_portal(&target.target_portal);
        let mut args = vec!["-m", "node", "-T", target.iqn.as_str(), "-p", portal.as_str()];
        args.extend_from_slice(action);
        let output = run_command(&self.binary, &args, None).await?;
        if output.success() {
            return Ok(None);
        }
        match output.code {
            Some(code) if code == ISCSI_ERR_NO_OBJS_FOUND || code == ISCSI_ERR_SESS_EXISTS => {
                Ok(Some(code))
            }
            _ => Err(Error::Iscsi {
                target: target.to_string(),
                reason: format!("{} failed: {}", action.join(" "), output.stderr.trim()),
            }),
        }
    }
}

#[async_trait]
impl IscsiClient for IscsiadmClient {
    async fn inspect(&self, target: &SessionTarget) -> Result<SessionState> {
        let state = classify_session(&self.sessions().await?, target);
        debug!("Session {} is {}", target, state);
        Ok(state)
    }

    async fn login(&self, target: &SessionTarget) -> Result<()> {
        // Make sure the node record exists; an existing record is fine
        self.node_command(target, &["-o", "new"]).await?;
        match self.node_command(target, &["--login"]).await? {
            Some(ISCSI_ERR_SESS_EXISTS) => debug!("Session {} already logged in", target),
            _ => info!("Logged in to {}", target),
        }
        Ok(())
    }

    async fn logout(&self, target: &SessionTarget) -> Result<()> {
        match self.node_command(target, &["--logout"]).await? {
            Some(ISCSI_ERR_NO_OBJS_FOUND) => debug!("No session to log out of for {}", target),
            _ => info!("Logged out of {}", target),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
Target: iqn.2010-10.org.example:vol-a (non-flash)
	Current Portal: 10.0.0.5:3260,1
	Persistent Portal: 10.0.0.5:3260,1
		**********
		Interface:
		**********
		Iface Name: default
		Iface Transport: tcp
		SID: 1
		iSCSI Connection State: LOGGED IN
		iSCSI Session State: LOGGED_IN
		Internal iscsid Session State: NO CHANGE
Target: iqn.2010-10.org.example:vol-b (non-flash)
	Current Portal: 10.0.0.6:3260,1
	Persistent Portal: 10.0.0.6:3260,1
		**********
		Interface:
		**********
		SID: 2
		iSCSI Connection State: TRANSPORT WAIT
		iSCSI Session State: FAILED
		Internal iscsid Session State: REOPEN
";

    fn target(iqn: &str, portal: &str) -> SessionTarget {
        SessionTarget {
            node_name: "worker-1".into(),
            target_portal: portal.into(),
            iqn: iqn.into(),
        }
    }

    #[test]
    fn test_parse_session_listing() {
        let sessions = parse_session_listing(LISTING);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].iqn, "iqn.2010-10.org.example:vol-a");
        assert_eq!(sessions[0].portal, "10.0.0.5:3260");
        assert_eq!(sessions[0].sid, Some(1));
        assert!(sessions[0].is_logged_in());
        assert_eq!(sessions[1].session_state.as_deref(), Some("FAILED"));
        assert_eq!(sessions[1].connection_state.as_deref(), Some("TRANSPORT WAIT"));
    }

    #[test]
    fn test_classify_session() {
        let sessions = parse_session_listing(LISTING);
        assert_eq!(
            classify_session(&sessions, &target("iqn.2010-10.org.example:vol-a", "10.0.0.5")),
            SessionState::Healthy
        );
        assert_eq!(
            classify_session(&sessions, &target("iqn.2010-10.org.example:vol-b", "10.0.0.6:3260")),
            SessionState::Stale
        );
        assert_eq!(
            classify_session(&sessions, &target("iqn.2010-10.org.example:vol-c", "10.0.0.5:3260")),
            SessionState::Missing
        );
        // Same IQN through a different portal is a different session
        assert_eq!(
            classify_session(&sessions, &target("iqn.2010-10.org.example:vol-a", "10.0.0.9:3260")),
            SessionState::Missing
        );
    }

    #[test]
    fn test_normalize_portal() {
        assert_eq!(normalize_portal("10.0.0.5"), "10.0.0.5:3260");
        assert_eq!(normalize_portal("10.0.0.5:3261,2"), "10.0.0.5:3261");
        assert_eq!(normalize_portal("[fd00::1]:3260"), "[fd00::1]:3260");
        assert_eq!(normalize_portal("[fd00::1]"), "[fd00::1]:3260");
    }

    #[test]
    fn test_empty_listing() {
        assert!(parse_session_listing("").is_empty());
    }
}
