// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{device::TpmDevice, error::CliError, util::parse_handle, Command};
use clap::{
    builder::styling::{AnsiColor, Color, Style, Styles},
    ArgGroup, Args, Parser, Subcommand,
};
use std::{
    io::Write,
    path::PathBuf,
    sync::{Arc, Mutex},
};

pub const DEFAULT_TPM_DEVICE: &str = "/dev/tpmrm0";

const STYLES: Styles = Styles::styled()
    .header(Style::new().bold())
    .usage(Style::new().bold())
    .literal(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Green))))
    .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Yellow))));

const HELP_TEMPLATE: &str = "
{about-with-newline}
{usage-heading} {usage}

{subcommands-heading}
{subcommands}

{options-heading}
{options}
";

fn handle_arg(s: &str) -> Result<u32, String> {
    parse_handle(s).map_err(|e| e.to_string())
}

/// TPM 2.0 credential activation and object management
#[derive(Parser, Debug)]
#[command(name = "tpmtool", version, about, styles = STYLES, help_template = HELP_TEMPLATE)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Arguments shared by every command that talks to a TPM.
#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    #[arg(
        long,
        default_value = DEFAULT_TPM_DEVICE,
        value_name = "PATH|HOST:PORT",
        help = "TPM device path, or the address of a TPM simulator"
    )]
    pub tpm: String,
}

macro_rules! tpmtool_command {
    ($($command:ident => $name:literal),* $(,)?) => {
        #[derive(Subcommand, Debug)]
        pub enum Commands {
            $(
                #[command(name = $name)]
                $command($command),
            )*
        }

        impl Commands {
            /// Returns the device specifier given to the command.
            #[must_use]
            pub fn device(&self) -> &str {
                match self {
                    $(Self::$command(args) => &args.device.tpm,)*
                }
            }
        }

        impl Command for Commands {
            fn is_local(&self) -> bool {
                match self {
                    $(Self::$command(args) => args.is_local(),)*
                }
            }

            fn run<W: Write>(
                &self,
                device: Option<Arc<Mutex<TpmDevice>>>,
                writer: &mut W,
            ) -> Result<(), CliError> {
                match self {
                    $(Self::$command(args) => args.run(device, writer),)*
                }
            }
        }
    };
}

tpmtool_command!(
    Activate => "activate",
    Caps => "caps",
    Create => "create",
    CreatePrimary => "createprimary",
    Evict => "evict",
    Flush => "flush",
    MakeCred => "makecred",
    NvRead => "nvread",
    ReadPublic => "readpublic",
);

/// Activates a credential and writes it to standard output
#[derive(Args, Debug)]
pub struct Activate {
    #[command(flatten)]
    pub device: DeviceArgs,
    #[arg(long, value_name = "FILE", help = "Credential blob from 'makecred'")]
    pub credin: PathBuf,
    #[arg(long, value_name = "FILE", help = "Encrypted secret from 'makecred'")]
    pub secretin: PathBuf,
    #[arg(long, value_parser = handle_arg, help = "Handle of the activating object")]
    pub handle: u32,
    #[arg(long, value_parser = handle_arg, help = "Handle of the key protecting the secret")]
    pub protector: u32,
    #[arg(long, default_value = "", help = "Password of the activating object")]
    pub pass: String,
    #[arg(long, default_value = "", help = "Password of the protector")]
    pub protectorpass: String,
}

/// Prints TPM capabilities
#[derive(Args, Debug)]
#[command(group(ArgGroup::new("selection").required(true).multiple(true)))]
pub struct Caps {
    #[command(flatten)]
    pub device: DeviceArgs,
    #[arg(long, group = "selection", help = "Supported algorithms")]
    pub algorithms: bool,
    #[arg(long, group = "selection", help = "Active handles")]
    pub handles: bool,
    #[arg(long, group = "selection", help = "Supported commands")]
    pub commands: bool,
    #[arg(long, group = "selection", help = "Fixed TPM properties")]
    pub properties: bool,
    #[arg(long, group = "selection", help = "All of the above")]
    pub all: bool,
}

/// Creates an object under a parent key
#[derive(Args, Debug)]
pub struct Create {
    #[command(flatten)]
    pub device: DeviceArgs,
    #[arg(long, value_name = "FILE", help = "JSON object template")]
    pub template: PathBuf,
    #[arg(long, value_parser = handle_arg, help = "Handle of the parent key")]
    pub parent: u32,
    #[arg(long, default_value = "", help = "Password of the parent key")]
    pub parentpass: String,
    #[arg(long, default_value = "", help = "Password of the new object")]
    pub pass: String,
    #[arg(
        long,
        value_parser = handle_arg,
        help = "Load the object and make it persistent at this handle"
    )]
    pub persistent: Option<u32>,
    #[arg(long, default_value = "", help = "Owner hierarchy password")]
    pub ownerpass: String,
    #[arg(long, value_name = "FILE", help = "Write the public area here")]
    pub pubout: Option<PathBuf>,
    #[arg(long, value_name = "FILE", help = "Write the private area here")]
    pub privout: Option<PathBuf>,
}

/// Creates a persistent primary object
#[derive(Args, Debug)]
pub struct CreatePrimary {
    #[command(flatten)]
    pub device: DeviceArgs,
    #[arg(long, value_name = "FILE", help = "JSON object template")]
    pub template: PathBuf,
    #[arg(long, value_parser = handle_arg, help = "Persistent handle for the object")]
    pub persistent: u32,
    #[arg(
        long,
        conflicts_with = "platform",
        help = "Create under the endorsement hierarchy"
    )]
    pub endorsement: bool,
    #[arg(long, help = "Create under the platform hierarchy")]
    pub platform: bool,
    #[arg(long, default_value = "", help = "Hierarchy password")]
    pub ownerpass: String,
    #[arg(long, default_value = "", help = "Password of the new object")]
    pub pass: String,
}

/// Removes a persistent object
#[derive(Args, Debug)]
pub struct Evict {
    #[command(flatten)]
    pub device: DeviceArgs,
    #[arg(long, value_parser = handle_arg, help = "Persistent handle")]
    pub handle: u32,
    #[arg(long, default_value = "", help = "Owner hierarchy password")]
    pub ownerpass: String,
}

/// Flushes a transient object or session
#[derive(Args, Debug)]
pub struct Flush {
    #[command(flatten)]
    pub device: DeviceArgs,
    #[arg(long, value_parser = handle_arg, help = "Transient object or session handle")]
    pub handle: u32,
}

/// Wraps a credential to a protector key, bound to an object's Name
#[derive(Args, Debug)]
pub struct MakeCred {
    #[command(flatten)]
    pub device: DeviceArgs,
    #[arg(long, value_parser = handle_arg, help = "Handle of the protector key")]
    pub handle: u32,
    #[arg(long, value_name = "FILE", help = "Public area of the object to bind to")]
    pub publicarea: PathBuf,
    #[arg(long, value_name = "FILE", help = "Output file for the credential blob")]
    pub credout: PathBuf,
    #[arg(long, value_name = "FILE", help = "Output file for the encrypted secret")]
    pub secretout: PathBuf,
    #[arg(
        long = "in",
        value_name = "FILE",
        help = "Credential to wrap [default: standard input]"
    )]
    pub input: Option<PathBuf>,
}

/// Reads an NV index
#[derive(Args, Debug)]
pub struct NvRead {
    #[command(flatten)]
    pub device: DeviceArgs,
    #[arg(long, value_parser = handle_arg, help = "NV index handle")]
    pub handle: u32,
    #[arg(long, default_value = "", help = "Owner hierarchy password")]
    pub pass: String,
    #[arg(long, value_name = "FILE", help = "Output file [default: standard output]")]
    pub out: Option<PathBuf>,
}

/// Reads the public area of an object
#[derive(Args, Debug)]
#[command(group(ArgGroup::new("source").required(true).args(["handle", "input"])))]
pub struct ReadPublic {
    #[command(flatten)]
    pub device: DeviceArgs,
    #[arg(long, value_parser = handle_arg, help = "Handle of a loaded or persistent object")]
    pub handle: Option<u32>,
    #[arg(long = "in", value_name = "FILE", help = "Public area file")]
    pub input: Option<PathBuf>,
    #[arg(long, value_name = "FILE", help = "Write the raw public area here")]
    pub out: Option<PathBuf>,
    #[arg(long, help = "Print the public key in PEM format")]
    pub pubout: bool,
    #[arg(long, help = "Print the public area as text")]
    pub text: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::normalize_args;
    use clap::CommandFactory;
    use rstest::rstest;
    use std::ffi::OsString;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        let args = normalize_args(args.iter().map(OsString::from));
        Cli::try_parse_from(args)
    }

    #[rstest]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[rstest]
    fn test_go_style_flags() {
        let cli = parse(&[
            "tpmtool",
            "activate",
            "-credin",
            "blob",
            "-secretin=secret",
            "-handle",
            "0x81000002",
            "-protector",
            "2164260865",
            "-tpm",
            "127.0.0.1:2321",
        ])
        .unwrap();
        let Commands::Activate(args) = &cli.command else {
            panic!("not activate");
        };
        assert_eq!(args.handle, 0x8100_0002);
        assert_eq!(args.protector, 0x8100_0001);
        assert_eq!(args.pass, "");
        assert_eq!(cli.command.device(), "127.0.0.1:2321");
    }

    #[rstest]
    fn test_default_device() {
        let cli = parse(&["tpmtool", "flush", "-handle", "0x80000000"]).unwrap();
        assert_eq!(cli.command.device(), DEFAULT_TPM_DEVICE);
    }

    #[rstest]
    #[case(&["tpmtool", "caps"])]
    #[case(&["tpmtool", "readpublic"])]
    #[case(&["tpmtool", "readpublic", "-handle", "1", "-in", "pub.bin"])]
    #[case(&["tpmtool", "makecred", "-handle", "1", "-publicarea", "p", "-credout", "c"])]
    #[case(&["tpmtool", "flush", "-handle", "0x1ffffffff"])]
    #[case(&["tpmtool", "createprimary", "-template", "t", "-persistent", "1", "-endorsement", "-platform"])]
    fn test_rejected_arguments(#[case] args: &[&str]) {
        assert!(parse(args).is_err());
    }

    #[rstest]
    fn test_local_readpublic() {
        let cli = parse(&["tpmtool", "readpublic", "-in", "pub.bin", "-text"]).unwrap();
        assert!(cli.command.is_local());
        let cli = parse(&["tpmtool", "readpublic", "-handle", "0x81000001"]).unwrap();
        assert!(!cli.command.is_local());
    }
}
