//! Bundled sample jobs, one per scan target type

/// `(name, job description JSON)`
pub const DEMO_JOBS: &[(&str, &str)] = &[
    ("k8s", include_str!("../demos/k8s.json")),
    ("ssh", include_str!("../demos/ssh.json")),
    ("ssh-via-ssm", include_str!("../demos/ssh_via_ssm.json")),
    ("awsssm", include_str!("../demos/awsssm.json")),
    ("winrm", include_str!("../demos/winrm.json")),
    ("aws-cis", include_str!("../demos/aws_cis.json")),
];

pub fn find(name: &str) -> Option<&'static str> {
    DEMO_JOBS
        .iter()
        .find(|(demo, _)| *demo == name)
        .map(|(_, json)| *json)
}

pub fn names() -> impl Iterator<Item = &'static str> {
    DEMO_JOBS.iter().map(|(name, _)| *name)
}
