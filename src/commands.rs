//! Stdin command protocol
//!
//! One command per line, tokenised with shlex and parsed with clap. `show`
//! reads the message text from the following lines until its end mark.
//! Every command becomes a [`Request`] for the event loop; bad lines are
//! logged and skipped.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};
use wlosd_overlay::Request;
use wlosd_types::{Align, AnchorEdge, DrawingSpec, ItemSpec, SizeSpec};

use crate::config;

/// Errors for one command line
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid quoting")]
    Quoting,

    #[error(transparent)]
    Parse(#[from] clap::Error),

    #[error("invalid pattern '{pattern}'")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Parser, Debug)]
#[command(
    name = "",
    disable_help_subcommand = true,
    disable_help_flag = true,
    disable_version_flag = true,
    after_help = "'help cmd' for more information about 'cmd'."
)]
struct CommandLine {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show a message.
    ///
    /// The following input lines compose the message text, read until the
    /// first empty line (see --end-mark). By default the message is centred;
    /// -t, -b, -l, -r move it, and combine into corners (-tl). A new message
    /// replaces the previous one with the same uid. Timeouts only ever extend
    /// a message: once shown without -s it stays until hidden with 'hide'.
    Show(ShowArgs),
    /// Hide messages.
    Hide(HideArgs),
    /// List all currently showing uids.
    ListUids,
    /// Reload the style from the config file.
    ReloadStyle,
    /// Display help information about cmd.
    Help { cmd: Option<String> },
    /// Terminate the program.
    #[command(alias = "quit")]
    Exit,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignArg {
    Left,
    Center,
    Right,
}

impl From<AlignArg> for Align {
    fn from(align: AlignArg) -> Self {
        match align {
            AlignArg::Left => Align::Left,
            AlignArg::Center => Align::Center,
            AlignArg::Right => Align::Right,
        }
    }
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct ShowArgs {
    /// Display the message at the top of the screen.
    #[arg(short, long)]
    pub top: bool,
    /// Display the message at the bottom of the screen.
    #[arg(short, long)]
    pub bottom: bool,
    /// Display the message on the left side of the screen.
    #[arg(short, long)]
    pub left: bool,
    /// Display the message on the right side of the screen.
    #[arg(short, long)]
    pub right: bool,
    /// Hide the message after SEC seconds.
    #[arg(short, long = "sec", value_name = "SEC")]
    pub sec: Option<f32>,
    /// Show the message on output OUT (e.g. DP-1).
    #[arg(short, long, value_name = "OUT")]
    pub output: Option<String>,
    /// Terminate the message input when reading MARK.
    #[arg(short, long, default_value = "", value_name = "MARK")]
    pub end_mark: String,
    /// Add a progress bar filled to F (0.0 to 1.0).
    #[arg(long, value_name = "F")]
    pub bar: Option<f32>,
    /// Put an icon (symbolic name or a single character) above the text.
    #[arg(long, value_name = "NAME")]
    pub icon: Option<String>,
    /// Fixed surface size instead of fitting the content.
    #[arg(long, value_name = "WxH", value_parser = parse_size)]
    pub size: Option<(u32, u32)>,
    /// Distance from the anchored edges, in pixels.
    #[arg(long, value_name = "PX")]
    pub margin: Option<i32>,
    /// Alignment of the text lines.
    #[arg(long, value_enum)]
    pub align: Option<AlignArg>,
    /// A unique identifier, used to replace or hide the message.
    pub uid: String,
}

impl ShowArgs {
    pub fn anchor(&self) -> Vec<AnchorEdge> {
        [
            (self.top, AnchorEdge::Top),
            (self.bottom, AnchorEdge::Bottom),
            (self.left, AnchorEdge::Left),
            (self.right, AnchorEdge::Right),
        ]
        .into_iter()
        .filter_map(|(set, edge)| set.then_some(edge))
        .collect()
    }

    /// Drawing spec for this command with the message `text`.
    ///
    /// Icon first, then one text row per non-empty line, then the bar.
    pub fn to_spec(&self, text: &str) -> DrawingSpec {
        let mut items = Vec::new();
        if let Some(icon) = &self.icon {
            items.push(ItemSpec::icon(icon.clone()));
        }
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            let mut item = ItemSpec::text(line);
            if let ItemSpec::Text { align, .. } = &mut item {
                *align = self.align.map(Align::from);
            }
            items.push(item);
        }
        if let Some(fraction) = self.bar {
            items.push(ItemSpec::bar(fraction));
        }

        DrawingSpec {
            items,
            anchor: self.anchor(),
            margin: self.margin,
            size: match self.size {
                Some((width, height)) => SizeSpec::Fixed { width, height },
                None => SizeSpec::ContentFit,
            },
            timeout_secs: self.sec,
            output: self.output.clone(),
        }
    }
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct HideArgs {
    /// Interpret each uid as a regular expression.
    #[arg(short, long)]
    pub regex: bool,
    /// uids to hide.
    #[arg(required = true, value_name = "uid")]
    pub uids: Vec<String>,
}

impl HideArgs {
    /// Request hiding the listed uids, or every uid matching one of the patterns
    pub fn to_requests(&self) -> Result<Vec<Request>, CommandError> {
        if !self.regex {
            return Ok(self
                .uids
                .iter()
                .map(|uid| Request::Dismiss {
                    channel: uid.clone(),
                })
                .collect());
        }

        let patterns = self
            .uids
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| CommandError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(vec![Request::DismissMatching(Box::new(move |channel: &str| {
            patterns.iter().any(|pattern| pattern.is_match(channel))
        }))])
    }
}

pub fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got '{value}'"))?;
    let width = width
        .trim()
        .parse()
        .map_err(|e| format!("invalid width '{width}': {e}"))?;
    let height = height
        .trim()
        .parse()
        .map_err(|e| format!("invalid height '{height}': {e}"))?;
    Ok((width, height))
}

/// Parse one command line. Blank lines give `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Command>, CommandError> {
    let mut args = shlex::split(line).ok_or(CommandError::Quoting)?;
    if args.is_empty() {
        return Ok(None);
    }
    args.insert(0, "wlosd".to_string());
    let cli = CommandLine::try_parse_from(args)?;
    Ok(Some(cli.command))
}

/// Usage text for `help [cmd]`
pub fn help_text(cmd: Option<&str>) -> String {
    let mut command = CommandLine::command();
    if let Some(name) = cmd
        && let Some(sub) = command.find_subcommand_mut(name)
    {
        return sub.render_long_help().to_string();
    }
    command.render_help().to_string()
}

/// Read message lines until `end_mark` or end of input
pub fn read_text<R: BufRead>(input: &mut R, end_mark: &str) -> io::Result<String> {
    let mut lines = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        let content = line.trim_end_matches(['\n', '\r']);
        if content == end_mark {
            break;
        }
        lines.push(content.to_string());
    }
    Ok(lines.join("\n"))
}

/// Feeds stdin commands to the event loop
pub struct CommandReader<R, W> {
    input: R,
    output: W,
    requests: Sender<Request>,
    config_path: Option<PathBuf>,
}

impl<R: BufRead, W: Write> CommandReader<R, W> {
    pub fn new(input: R, output: W, requests: Sender<Request>, config_path: Option<&Path>) -> Self {
        Self {
            input,
            output,
            requests,
            config_path: config_path.map(Path::to_path_buf),
        }
    }

    /// Process commands until `exit`, end of input, or the loop going away.
    /// A shutdown request is always sent on the way out.
    pub fn run(&mut self) -> io::Result<()> {
        let result = self.serve();
        // The loop may already be gone
        let _ = self.requests.send(Request::Shutdown);
        result
    }

    fn serve(&mut self) -> io::Result<()> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.input.read_line(&mut line)? == 0 {
                info!("stdin was closed");
                return Ok(());
            }

            let command = match parse_line(line.trim_end_matches(['\n', '\r'])) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Skipping command");
                    continue;
                }
            };
            debug!(?command, "Command");

            if !self.execute(command)? {
                return Ok(());
            }
        }
    }

    /// Returns false when reading should stop
    fn execute(&mut self, command: Command) -> io::Result<bool> {
        let requests = match command {
            Command::Show(args) => {
                let text = read_text(&mut self.input, &args.end_mark)?;
                vec![Request::Submit {
                    spec: args.to_spec(&text),
                    channel: args.uid,
                }]
            }
            Command::Hide(args) => match args.to_requests() {
                Ok(requests) => requests,
                Err(e) => {
                    warn!(error = %e, "Skipping command");
                    return Ok(true);
                }
            },
            Command::ListUids => {
                let (reply_tx, reply_rx) = mpsc::channel();
                if self.requests.send(Request::ListChannels(reply_tx)).is_err() {
                    return Ok(false);
                }
                let Ok(channels) = reply_rx.recv() else {
                    return Ok(false);
                };
                for channel in channels {
                    writeln!(self.output, "{channel}")?;
                }
                self.output.flush()?;
                return Ok(true);
            }
            Command::ReloadStyle => match config::load(self.config_path.as_deref()) {
                Ok(config) => vec![Request::SetStyle(config.style)],
                Err(e) => {
                    warn!(error = %e, "Style not reloaded");
                    return Ok(true);
                }
            },
            Command::Help { cmd } => {
                write!(self.output, "{}", help_text(cmd.as_deref()))?;
                self.output.flush()?;
                return Ok(true);
            }
            Command::Exit => return Ok(false),
        };

        for request in requests {
            if self.requests.send(request).is_err() {
                debug!("Event loop is gone, stopping command reader");
                return Ok(false);
            }
        }
        Ok(true)
    }
}
