//! Parsing of the `CNI_ARGS` key/value blob passed by the runtime.
//!
//! Pod names follow the convention `<service>-<numeric>-<stage>-<suffix>`:
//! the service is everything before the first `-<digits>` group and the
//! release stage is the first `-`-delimited word after it.

use std::net::IpAddr;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SERVICE_SPLIT: Regex = Regex::new(r"-\d+").unwrap();
    static ref STAGE_SPLIT: Regex = Regex::new(r"-\d+-").unwrap();
}

/// Look up a key in the `;`-separated `K=V` pairs of `CNI_ARGS`.
fn arg_value<'a>(env_args: &'a str, key: &str) -> Option<&'a str> {
    env_args.split(';').find_map(|pair| {
        let mut kv = pair.splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some(k), Some(v)) if k == key => Some(v),
            _ => None,
        }
    })
}

/// Extract the service and pod name from `CNI_ARGS`.
///
/// The service is the leading alphabetic portion of `K8S_POD_NAME`, e.g.
/// `pay` for `pay-10-online-84f8cc5d4b-8v4fw`.
pub fn service_and_pod(env_args: &str) -> Option<(String, String)> {
    let pod = arg_value(env_args, "K8S_POD_NAME")?;
    let service = SERVICE_SPLIT.split(pod).next()?;
    if service.is_empty() {
        return None;
    }
    Some((service.to_string(), pod.to_string()))
}

/// Extract the release stage from `CNI_ARGS`, e.g. `sandbox` or `online`.
///
/// Returns `None` when the pod name does not follow the naming convention;
/// callers treat that as a hard failure rather than assuming a stage.
pub fn deploy_stage(env_args: &str) -> Option<String> {
    let pod = arg_value(env_args, "K8S_POD_NAME")?;
    let piece = STAGE_SPLIT.split(pod).nth(1)?;
    let stage = piece.split('-').next()?;
    if stage.is_empty() {
        return None;
    }
    Some(stage.to_string())
}

/// Static addresses requested through the legacy `IP` CNI arg
/// (comma-separated). Unparseable entries are ignored.
pub fn requested_ips(env_args: &str) -> Vec<IpAddr> {
    arg_value(env_args, "IP")
        .map(|list| list.split(',').filter_map(|ip| ip.trim().parse().ok()).collect())
        .unwrap_or_default()
}

/// A random link name for the initial macvlan creation. The kernel refuses
/// to create a link whose name collides with one in the host namespace, so
/// the final name is only applied after the move into the target namespace.
pub fn random_ifname() -> String {
    format!("mv{:08x}", rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARGS: &str =
        "IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=pay-10-online-84f8cc5d4b-8v4fw";

    #[test]
    fn test_service_and_pod() {
        let (service, pod) = service_and_pod(ARGS).expect("service");
        assert_eq!(service, "pay");
        assert_eq!(pod, "pay-10-online-84f8cc5d4b-8v4fw");
    }

    #[test]
    fn test_deploy_stage() {
        assert_eq!(deploy_stage(ARGS).as_deref(), Some("online"));
        assert_eq!(
            deploy_stage("K8S_POD_NAME=pay-10-sandbox-abc").as_deref(),
            Some("sandbox")
        );
    }

    #[test]
    fn test_stage_requires_naming_convention() {
        // No -<digits>- group: there is nothing to split on.
        assert_eq!(deploy_stage("K8S_POD_NAME=payonline"), None);
        assert_eq!(deploy_stage("K8S_POD_NAMESPACE=default"), None);
    }

    #[test]
    fn test_requested_ips() {
        let args = "K8S_POD_NAME=pay-10-online-abc;IP=172.16.28.150,172.16.28.151,bogus";
        let ips = requested_ips(args);
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[0], "172.16.28.150".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_malformed_pairs_are_skipped() {
        assert_eq!(service_and_pod("novalue;K8S_POD_NAME=db-2-sandbox-x;"), {
            Some(("db".to_string(), "db-2-sandbox-x".to_string()))
        });
    }

    #[test]
    fn test_random_ifname_fits_ifnamsiz() {
        let name = random_ifname();
        assert!(name.len() <= 15);
        assert!(name.starts_with("mv"));
    }
}
