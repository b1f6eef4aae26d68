use colored::Colorize;
use deskpilot::pause::clamp_resume_minutes;
use deskpilot::{ControlState, ResumeChoice, ResumePrompt};
use std::io::{self, BufRead, BufReader, Stdin, Stdout, Write};

/// Line-based resume prompt on a terminal.
///
/// `r` resumes now, a number (or an empty line for the default) resumes
/// after that many minutes, anything else keeps the pause.
pub struct TerminalPrompt<R, W> {
    input: R,
    output: W,
}

impl TerminalPrompt<BufReader<Stdin>, Stdout> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R: BufRead, W: Write> TerminalPrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    fn render(&mut self, state: &ControlState, default_minutes: u32) -> io::Result<()> {
        writeln!(self.output, "{}", "Automation paused due to user input.".bold().yellow())?;
        let reason = state.paused_reason();
        if !reason.is_empty() {
            writeln!(self.output, "  reason: {}", reason.dimmed())?;
        }
        write!(
            self.output,
            "  [{}]esume now, resume in N minutes [{}], [{}]eep paused: ",
            "r".bold(),
            default_minutes.to_string().bold(),
            "k".bold()
        )?;
        self.output.flush()
    }
}

/// Maps one answer line to a choice.
pub fn parse_answer(line: &str, default_minutes: u32) -> ResumeChoice {
    let answer = line.trim().to_ascii_lowercase();
    match answer.as_str() {
        "" => ResumeChoice::ResumeIn {
            minutes: clamp_resume_minutes(default_minutes),
        },
        "r" | "resume" | "now" => ResumeChoice::ResumeNow,
        other => match other.parse::<u32>() {
            Ok(minutes) => ResumeChoice::ResumeIn {
                minutes: clamp_resume_minutes(minutes),
            },
            Err(_) => ResumeChoice::KeepPaused,
        },
    }
}

impl<R: BufRead + Send, W: Write + Send> ResumePrompt for TerminalPrompt<R, W> {
    fn ask(&mut self, state: &ControlState, default_minutes: u32) -> ResumeChoice {
        if self.render(state, default_minutes).is_err() {
            return ResumeChoice::KeepPaused;
        }
        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) | Err(_) => ResumeChoice::KeepPaused,
            Ok(_) => parse_answer(&line, default_minutes),
        }
    }
}
