use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;

use crate::version;

/// Per-node agent that attaches and detaches secondary networks declared by
/// the `networks` pod annotation.
#[derive(Parser)]
#[command(name = "podagent", about, long_about = None, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Absolute path to the kubeconfig file (unset means in-cluster configuration)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "NODE_NAME",
        help = "Node name as registered with the kube-apiserver; the watch is limited to pods bound to this node"
    )]
    pub node: String,

    #[arg(
        long,
        default_value = "unix:///var/run/docker.sock",
        help = "Docker daemon endpoint"
    )]
    pub docker_endpoint: String,

    #[arg(
        long,
        default_value = "unix:///var/run/crio/crio.sock",
        help = "CRI-O runtime endpoint"
    )]
    pub crio_endpoint: String,

    #[arg(
        long,
        default_value = "/opt/cni/bin",
        value_hint = clap::ValueHint::DirPath,
        help = "CNI plugin binary directory"
    )]
    pub cni_bin_path: PathBuf,

    #[arg(
        long,
        default_value = "/etc/cni/net.d",
        value_hint = clap::ValueHint::DirPath,
        help = "CNI network configuration directory"
    )]
    pub cni_conf_path: PathBuf,

    #[arg(
        long,
        default_value = "",
        help = "CNI vendor name (empty means derive the vendor directory from the plugin type of the first lexical config)"
    )]
    pub cni_vendor_name: String,

    #[arg(
        long,
        value_enum,
        default_value_t = ContainerKind::Docker,
        help = "Container runtime backing the pods on this node"
    )]
    pub container_type: ContainerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ContainerKind {
    Docker,
    Crio,
}
