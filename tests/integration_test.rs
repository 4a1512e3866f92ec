// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use cli::{
    cli::{Caps, Commands, DeviceArgs, ReadPublic},
    device::TpmDevice,
    error::CliError,
    Command,
};

use std::{
    fs,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    process::{Child, Command as ProcessCommand, Output, Stdio},
    sync::{Arc, Mutex},
};

use rstest::{fixture, rstest};
use tempfile::{tempdir, TempDir};

const NV_INDEX: &str = "0x01c00002";
const NV_DATA: &[u8] = b"endorsement key certificate";

const STORAGE_TEMPLATE: &str = r#"{
    "type": "rsa",
    "name_alg": "sha256",
    "attributes": ["fixedtpm", "fixedparent", "sensitivedataorigin",
                   "userwithauth", "restricted", "decrypt"],
    "rsa": {
        "symmetric": { "alg": "aes", "key_bits": 128, "mode": "cfb" },
        "key_bits": 2048
    }
}"#;

const SIGNING_TEMPLATE: &str = r#"{
    "type": "rsa",
    "name_alg": "sha256",
    "attributes": ["fixedtpm", "fixedparent", "sensitivedataorigin",
                   "userwithauth", "sign_encrypt"],
    "rsa": {
        "scheme": { "scheme": "rsassa", "hash": "sha256" },
        "key_bits": 2048
    }
}"#;

struct TestFixture {
    child: Child,
    address: String,
    dir: TempDir,
}

impl Drop for TestFixture {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl TestFixture {
    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write(&self, name: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        let path = self.path(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn tpmtool(&self, args: &[&str]) -> Output {
        ProcessCommand::new(env!("CARGO_BIN_EXE_tpmtool"))
            .args(args)
            .args(["-tpm", &self.address])
            .stdin(Stdio::null())
            .output()
            .expect("Failed to run tpmtool")
    }

    /// Runs `tpmtool` and returns its standard output, failing the test if
    /// the command does not succeed.
    fn tpmtool_ok(&self, args: &[&str]) -> Vec<u8> {
        let output = self.tpmtool(args);
        assert!(
            output.status.success(),
            "tpmtool {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        output.stdout
    }

    fn device(&self) -> Arc<Mutex<TpmDevice>> {
        Arc::new(Mutex::new(TpmDevice::open(&self.address).unwrap()))
    }
}

#[fixture]
fn mock_tpm() -> TestFixture {
    let nv = format!("{NV_INDEX}={}", hex::encode(NV_DATA));
    let mut child = ProcessCommand::new(env!("CARGO_BIN_EXE_mock-tpm"))
        .args(["--port", "0", "--nv", &nv])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn mock-tpm binary");

    let stdout = child.stdout.take().unwrap();
    let mut line = String::new();
    BufReader::new(stdout).read_line(&mut line).unwrap();
    let address = line
        .trim()
        .strip_prefix("listening on ")
        .unwrap_or_else(|| panic!("unexpected mock-tpm output: {line:?}"))
        .to_string();

    TestFixture {
        child,
        address,
        dir: tempdir().unwrap(),
    }
}

fn run_command(cmd: &Commands, device: Option<Arc<Mutex<TpmDevice>>>) -> Result<String, CliError> {
    let mut output = Vec::new();
    cmd.run(device.clone(), &mut output)?;
    if let Some(device) = device {
        if let Ok(mutex) = Arc::try_unwrap(device) {
            mutex.into_inner().unwrap().close()?;
        }
    }
    Ok(String::from_utf8(output).unwrap())
}

fn str_path(path: &Path) -> &str {
    path.to_str().unwrap()
}

fn enroll(fixture: &TestFixture) -> PathBuf {
    let storage = fixture.write("storage.json", STORAGE_TEMPLATE);
    let signing = fixture.write("signing.json", SIGNING_TEMPLATE);
    let public = fixture.path("ak.pub");

    fixture.tpmtool_ok(&[
        "createprimary",
        "-template",
        str_path(&storage),
        "-persistent",
        "0x81000001",
        "-endorsement",
        "-pass",
        "ekpass",
    ]);
    fixture.tpmtool_ok(&[
        "create",
        "-template",
        str_path(&signing),
        "-parent",
        "0x81000001",
        "-parentpass",
        "ekpass",
        "-pass",
        "akpass",
        "-persistent",
        "0x81000002",
        "-pubout",
        str_path(&public),
    ]);
    public
}

#[rstest]
fn test_credential_activation(mock_tpm: TestFixture) {
    let public = enroll(&mock_tpm);
    let credential = mock_tpm.write("credential", b"0123456789abcdef");
    let blob = mock_tpm.path("cred.blob");
    let secret = mock_tpm.path("cred.secret");

    mock_tpm.tpmtool_ok(&[
        "makecred",
        "-handle",
        "0x81000001",
        "-publicarea",
        str_path(&public),
        "-in",
        str_path(&credential),
        "-credout",
        str_path(&blob),
        "-secretout",
        str_path(&secret),
    ]);
    assert_eq!(fs::read(&secret).unwrap().len(), 256);

    let recovered = mock_tpm.tpmtool_ok(&[
        "activate",
        "-credin",
        str_path(&blob),
        "-secretin",
        str_path(&secret),
        "-handle",
        "0x81000002",
        "-protector",
        "0x81000001",
        "-pass",
        "akpass",
        "-protectorpass",
        "ekpass",
    ]);
    assert_eq!(recovered, b"0123456789abcdef");

    let output = mock_tpm.tpmtool(&[
        "activate",
        "-credin",
        str_path(&blob),
        "-secretin",
        str_path(&secret),
        "-handle",
        "0x81000002",
        "-protector",
        "0x81000001",
        "-pass",
        "wrong",
        "-protectorpass",
        "ekpass",
    ]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[rstest]
fn test_makecred_from_stdin(mock_tpm: TestFixture) {
    let public = enroll(&mock_tpm);
    let blob = mock_tpm.path("cred.blob");
    let secret = mock_tpm.path("cred.secret");

    let mut child = ProcessCommand::new(env!("CARGO_BIN_EXE_tpmtool"))
        .args([
            "makecred",
            "-handle",
            "0x81000001",
            "-publicarea",
            str_path(&public),
            "-credout",
            str_path(&blob),
            "-secretout",
            str_path(&secret),
            "-tpm",
            &mock_tpm.address,
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn tpmtool");
    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(b"piped credential").unwrap();
    drop(stdin);
    let output = child.wait_with_output().unwrap();
    assert!(
        output.status.success(),
        "makecred failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(output.stdout.is_empty());

    let recovered = mock_tpm.tpmtool_ok(&[
        "activate",
        "-credin",
        str_path(&blob),
        "-secretin",
        str_path(&secret),
        "-handle",
        "0x81000002",
        "-protector",
        "0x81000001",
        "-pass",
        "akpass",
        "-protectorpass",
        "ekpass",
    ]);
    assert_eq!(recovered, b"piped credential");
}

#[rstest]
fn test_readpublic(mock_tpm: TestFixture) {
    let public = enroll(&mock_tpm);

    let raw = mock_tpm.tpmtool_ok(&["readpublic", "-handle", "0x81000002"]);
    assert_eq!(raw, fs::read(&public).unwrap());

    let local = String::from_utf8(
        mock_tpm.tpmtool_ok(&["readpublic", "-in", str_path(&public), "-text"]),
    )
    .unwrap();
    assert!(local.contains("TPM2_ALG_RSA"));
    assert!(!local.contains("Qualified name"));

    let pem = String::from_utf8(mock_tpm.tpmtool_ok(&[
        "readpublic",
        "-in",
        str_path(&public),
        "-pubout",
    ]))
    .unwrap();
    assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----\n"));

    let cmd = Commands::ReadPublic(ReadPublic {
        device: DeviceArgs {
            tpm: mock_tpm.address.clone(),
        },
        handle: Some(0x8100_0002),
        input: None,
        out: None,
        pubout: false,
        text: true,
    });
    let text = run_command(&cmd, Some(mock_tpm.device())).unwrap();
    assert!(text.contains("Qualified name"));
    assert!(text.contains("Modulus"));
}

#[rstest]
fn test_caps(mock_tpm: TestFixture) {
    let cmd = Commands::Caps(Caps {
        device: DeviceArgs {
            tpm: mock_tpm.address.clone(),
        },
        algorithms: false,
        handles: false,
        commands: false,
        properties: false,
        all: true,
    });
    let output = run_command(&cmd, Some(mock_tpm.device())).unwrap();
    for heading in [
        "TPM2_CAP_ALGS:",
        "TPM2_CAP_HANDLES:",
        "TPM2_CAP_COMMANDS:",
        "TPM2_CAP_TPM_PROPERTIES:",
    ] {
        assert!(output.contains(heading), "missing {heading}");
    }
    assert!(output.contains("TPM2_ALG_SHA256"));
    assert!(output.contains("0x01C00002"));

    let handles = String::from_utf8(mock_tpm.tpmtool_ok(&["caps", "-handles"])).unwrap();
    assert!(handles.contains("TPM2_CAP_HANDLES:"));
    assert!(!handles.contains("TPM2_CAP_ALGS:"));
}

#[rstest]
fn test_evict(mock_tpm: TestFixture) {
    enroll(&mock_tpm);
    mock_tpm.tpmtool_ok(&["evict", "-handle", "0x81000002"]);
    assert!(!mock_tpm
        .tpmtool(&["readpublic", "-handle", "0x81000002"])
        .status
        .success());
    assert!(!mock_tpm
        .tpmtool(&["evict", "-handle", "0x80000000"])
        .status
        .success());
}

#[rstest]
fn test_nvread(mock_tpm: TestFixture) {
    let data = mock_tpm.tpmtool_ok(&["nvread", "-handle", NV_INDEX]);
    assert_eq!(data, NV_DATA);

    let out = mock_tpm.path("nv.bin");
    let stdout = mock_tpm.tpmtool_ok(&["nvread", "-handle", NV_INDEX, "-out", str_path(&out)]);
    assert!(stdout.is_empty());
    assert_eq!(fs::read(&out).unwrap(), NV_DATA);
}

#[rstest]
fn test_missing_device() {
    let output = ProcessCommand::new(env!("CARGO_BIN_EXE_tpmtool"))
        .args(["flush", "-handle", "0x80000000", "-tpm", "nosuch/path"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}
