//! S3 object reads and writes
//!
//! Bodies are streamed through the CLI's stdin/stdout (`-` as the local
//! side of `s3 cp`), so nothing touches disk here.

use anyhow::Result;

use super::AwsCli;

pub fn object_uri(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{}", key.trim_start_matches('/'))
}

pub async fn get_object(cli: &AwsCli, bucket: &str, key: &str) -> Result<Vec<u8>> {
    let uri = object_uri(bucket, key);
    let cmd = cli.command(&["s3", "cp", &uri, "-", "--only-show-errors"]);
    cli.output(cmd, &format!("s3 get {uri}")).await
}

pub async fn put_object(cli: &AwsCli, bucket: &str, key: &str, body: &[u8]) -> Result<()> {
    let uri = object_uri(bucket, key);
    let cmd = cli.command(&[
        "s3",
        "cp",
        "-",
        &uri,
        "--content-type",
        "application/json",
        "--only-show-errors",
    ]);
    cli.output_with_stdin(cmd, body, &format!("s3 put {uri}")).await
}
