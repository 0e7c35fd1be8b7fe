//! Container label keys shared with the engine's own tooling.

use std::collections::BTreeMap;

/// Caller-visible container name.
pub const NAME: &str = "nerdctl/name";
/// JSON list of [`crate::PortMapping`].
pub const PORTS: &str = "nerdctl/ports";
/// Hostname recorded at creation.
pub const HOSTNAME: &str = "nerdctl/hostname";
/// JSON list of attached network names.
pub const NETWORKS: &str = "nerdctl/networks";
/// Stop signal copied from the image config.
pub const STOP_SIGNAL: &str = "io.containerd.image.config.stop-signal";

pub const K8S_POD_NAMESPACE: &str = "io.kubernetes.pod.namespace";
pub const K8S_POD_NAME: &str = "io.kubernetes.pod.name";
pub const K8S_CONTAINER_NAME: &str = "io.kubernetes.container.name";

/// Name shown for a container in listings.
///
/// Prefers the explicit name label. Containers created by a kubelet carry pod
/// labels instead and are shown as `k8s://<namespace>/<pod>/<container>`.
/// Anything else has no display name.
pub fn display_name(labels: &BTreeMap<String, String>) -> String {
    if let Some(name) = labels.get(NAME) {
        return name.clone();
    }
    let pod = (
        labels.get(K8S_POD_NAMESPACE),
        labels.get(K8S_POD_NAME),
        labels.get(K8S_CONTAINER_NAME),
    );
    if let (Some(ns), Some(pod), Some(container)) = pod {
        return format!("k8s://{ns}/{pod}/{container}");
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn name_label_wins() {
        let l = labels(&[(NAME, "worker-0"), (K8S_POD_NAME, "ignored")]);
        assert_eq!(display_name(&l), "worker-0");
    }

    #[test]
    fn pod_labels_build_structured_name() {
        let l = labels(&[
            (K8S_POD_NAMESPACE, "kube-system"),
            (K8S_POD_NAME, "coredns-abc"),
            (K8S_CONTAINER_NAME, "coredns"),
        ]);
        assert_eq!(display_name(&l), "k8s://kube-system/coredns-abc/coredns");
    }

    #[test]
    fn partial_pod_labels_give_empty_name() {
        let l = labels(&[(K8S_POD_NAMESPACE, "default")]);
        assert_eq!(display_name(&l), "");
        assert_eq!(display_name(&BTreeMap::new()), "");
    }
}
