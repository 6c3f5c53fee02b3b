use crate::session::Session;
use covmin_core::FuzzOptions;
use covmin_core::overview::format_signed;

use std::io::{self, BufRead, Write};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Fuzz,
    Reduce,
    Dump,
    Save,
    ShowCoverage,
    Clear,
    Lucky,
    Quit,
}

const ACTIONS: [(Action, &str); 8] = [
    (Action::Fuzz, "Start fuzzing"),
    (Action::Reduce, "Reduce corpus"),
    (Action::Dump, "Dump corpus"),
    (Action::Save, "Save corpus to JSON file"),
    (Action::ShowCoverage, "Show coverage"),
    (Action::Clear, "Clear corpus"),
    (Action::Lucky, "I'm feeling lucky"),
    (Action::Quit, "Quit"),
];

/// Interactive main loop. Returns on "Quit" or end of input.
pub fn run(session: &mut Session) -> Result<(), anyhow::Error> {
    let stdin = io::stdin();
    let mut input = stdin.lock();

    loop {
        println!("{}\n", session.overview());
        for (index, (_, label)) in ACTIONS.iter().enumerate() {
            println!("  {}) {}", index + 1, label);
        }
        let Some(answer) = ask(&mut input, "What do you want?", "")? else {
            return Ok(());
        };
        let Some(&(action, _)) = answer
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|index| ACTIONS.get(index))
        else {
            println!("Please pick a number between 1 and {}.\n", ACTIONS.len());
            continue;
        };
        // A Ctrl-C pressed at the prompt must not cancel the chosen action.
        session.reset_interrupt();

        match action {
            Action::Quit => return Ok(()),
            Action::Fuzz => {
                let Some(options) = ask_fuzz_options(&mut input, session)? else {
                    return Ok(());
                };
                report(session.fuzz(&options));
                session.reset_interrupt();
                report(session.show_coverage().map(drop));
            }
            Action::Reduce => {
                let summary = session.reduce()?;
                println!(
                    "Reduced by {} files and {} bytes in {:.1}s ({} coverage measurements){}",
                    format_signed(summary.after.files as i64 - summary.before.files as i64),
                    format_signed(summary.after.bytes as i64 - summary.before.bytes as i64),
                    summary.seconds,
                    summary.oracle.calls,
                    if summary.cancelled { ", interrupted" } else { "" }
                );
                session.reset_interrupt();
                report(session.show_coverage().map(drop));
            }
            Action::Dump => report(session.dump(false)),
            Action::Save => report(session.dump(true)),
            Action::ShowCoverage => match session.show_coverage() {
                Ok(index) => println!("Open file://{} in a browser.", index.display()),
                Err(e) => log::error!("{e:#}"),
            },
            Action::Clear => {
                let confirmed = ask_parsed(
                    &mut input,
                    "Do you really want to clear the corpus directory? (y/N)",
                    YesNo(false),
                )?;
                if confirmed.is_some_and(|YesNo(yes)| yes) {
                    report(session.clear());
                }
            }
            Action::Lucky => {
                session.lucky()?;
                session.reset_interrupt();
                report(session.show_coverage().map(drop));
            }
        }
        println!();
    }
}

fn report(result: Result<(), anyhow::Error>) {
    if let Err(e) = result {
        log::error!("{e:#}");
    }
}

fn ask_fuzz_options(
    input: &mut impl BufRead,
    session: &Session,
) -> Result<Option<FuzzOptions>, anyhow::Error> {
    let defaults = FuzzOptions::from(&session.config().fuzz);
    let questions = (
        ask_parsed(
            input,
            "The maximal time the fuzzer should run in seconds (0 means forever)",
            defaults.max_total_time,
        )?,
        ask_parsed(input, "The maximal fuzzer runs (-1 means infinite)", defaults.runs)?,
        ask_parsed(
            input,
            "The number of parallel fuzz jobs (0 means no concurrency)",
            defaults.jobs,
        )?,
        ask_parsed(
            input,
            "The maximal length for generated inputs in bytes (0 means no limit)",
            defaults.max_len,
        )?,
        ask_parsed(input, "Only create ASCII characters? (y/N)", YesNo(defaults.only_ascii))?,
    );
    let (Some(max_total_time), Some(runs), Some(jobs), Some(max_len), Some(YesNo(only_ascii))) =
        questions
    else {
        return Ok(None);
    };
    Ok(Some(FuzzOptions {
        max_total_time,
        runs,
        jobs,
        max_len,
        only_ascii,
    }))
}

/// Reads one trimmed line after printing `question`; `None` at end of input.
fn ask(
    input: &mut impl BufRead,
    question: &str,
    default: &str,
) -> Result<Option<String>, anyhow::Error> {
    if default.is_empty() {
        print!("{question} ");
    } else {
        print!("{question} [{default}] ");
    }
    io::stdout().flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// Asks until the answer parses; an empty answer takes `default`.
fn ask_parsed<T>(
    input: &mut impl BufRead,
    question: &str,
    default: T,
) -> Result<Option<T>, anyhow::Error>
where
    T: FromStr + ToString,
{
    loop {
        let Some(answer) = ask(input, question, &default.to_string())? else {
            return Ok(None);
        };
        if answer.is_empty() {
            return Ok(Some(default));
        }
        match answer.parse() {
            Ok(value) => return Ok(Some(value)),
            Err(_) => println!("'{answer}' is not a valid answer."),
        }
    }
}

/// A y/n answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct YesNo(bool);

impl FromStr for YesNo {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "y" | "yes" => Ok(YesNo(true)),
            "n" | "no" => Ok(YesNo(false)),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for YesNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0 { "y" } else { "n" })
    }
}
