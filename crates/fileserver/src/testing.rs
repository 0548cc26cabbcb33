//! Test helpers shared across modules

use crate::tool::TunnelTool;

/// Mock tunneling tool run through `/bin/sh`
///
/// `run` is the shell body executed for `<protocol> <local-address>`. The
/// mock records its PID so that `kill` can terminate it; a body that deletes
/// `$(dirname "$0")/pid` makes the instance ignore `kill`. The token `bad` is
/// rejected by `authtoken`.
pub(crate) fn mock_tool(run: &str) -> (tempfile::TempDir, TunnelTool) {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let script = format!(
        r#"case "$1" in
  --version) echo "mock 1.0" ;;
  authtoken) [ "$2" = "bad" ] && {{ echo "invalid token" >&2; exit 1; }}; exit 0 ;;
  kill) [ -f "{pid}" ] && kill "$(cat "{pid}")"; exit 0 ;;
  *) echo $$ > "{pid}"
{run}
  ;;
esac
"#,
        pid = pid_file.display(),
        run = run
    );
    let path = dir.path().join("tool.sh");
    std::fs::write(&path, script).unwrap();
    let tool = TunnelTool::new("/bin/sh").with_leading_args([path.to_string_lossy().into_owned()]);
    (dir, tool)
}

/// A port that was free a moment ago
pub(crate) fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
