use crescent_vm::{LuaError, State, MULTRET};

const USAGE: &str = "usage: crescent [options] [script]
Available options are:
  -e code, --execute code   execute string 'code'
  -i, --interactive         enter interactive mode
  script                    load and run the script file";

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() == 1 {
        println!("{USAGE}");
        return;
    }

    let mut exec_statements: Vec<String> = Vec::new();
    let mut script_file: Option<String> = None;
    let mut interactive = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-i" | "--interactive" => {
                interactive = true;
                i += 1;
            }
            "-e" | "--execute" => {
                if i + 1 >= args.len() {
                    eprintln!("crescent: '{}' needs an argument", args[i]);
                    std::process::exit(1);
                }
                exec_statements.push(args[i + 1].clone());
                i += 2;
            }
            other => {
                if other.starts_with('-') && other != "-" {
                    eprintln!("crescent: unrecognized option '{other}'");
                    eprintln!("{USAGE}");
                    std::process::exit(1);
                }
                script_file = Some(other.to_string());
                i += 1;
            }
        }
    }

    let mut state = create_state();

    for code in &exec_statements {
        if let Err(e) = run_chunk(&mut state, code.as_bytes(), "=(command line)") {
            eprintln!("crescent: {e}");
            std::process::exit(1);
        }
    }

    if let Some(path) = script_file {
        let source = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                eprintln!("crescent: cannot open {path}: {e}");
                std::process::exit(1);
            }
        };
        let source = strip_shebang(&source);
        let chunk_name = format!("@{path}");
        if let Err(e) = run_chunk(&mut state, source, &chunk_name) {
            eprintln!("crescent: {e}");
            std::process::exit(1);
        }
    }

    if interactive {
        run_repl(state);
    }
}

fn create_state() -> State {
    let mut state = State::new();
    if let Err(e) = crescent_stdlib::register_all(&mut state) {
        eprintln!("crescent: cannot open standard libraries: {e}");
        std::process::exit(1);
    }
    state
}

/// Compile and run a chunk, discarding its results.
fn run_chunk(state: &mut State, source: &[u8], name: &str) -> Result<(), LuaError> {
    state.load(source, name)?;
    state.run()
}

/// Compile and run a chunk, returning its results rendered for the REPL.
fn run_chunk_display(
    state: &mut State,
    source: &[u8],
    name: &str,
) -> Result<Vec<String>, LuaError> {
    state.load(source, name)?;
    let before = state.get_top() - 1; // below the loaded closure
    state.call(0, MULTRET)?;
    let nresults = state.get_top() - before;
    let mut rendered = Vec::with_capacity(nresults);
    for i in 0..nresults {
        let v = state.to_value((before + i + 1) as i32);
        rendered.push(state.display_value(v));
    }
    state.pop(nresults);
    Ok(rendered)
}

fn strip_shebang(source: &[u8]) -> &[u8] {
    if source.starts_with(b"#") {
        match source.iter().position(|&b| b == b'\n') {
            Some(pos) => &source[pos + 1..],
            None => b"",
        }
    } else {
        source
    }
}

fn run_repl(mut state: State) {
    let config = rustyline::config::Config::builder()
        .auto_add_history(true)
        .build();

    let mut rl = match rustyline::DefaultEditor::with_config(config) {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("crescent: cannot initialize REPL: {e}");
            return;
        }
    };

    loop {
        match rl.readline("> ") {
            Ok(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if line == "exit" || line == "quit" {
                    break;
                }

                // Try as an expression first so `1+2` echoes its value,
                // then fall back to a statement.
                let as_expr = format!("return {line}");
                match run_chunk_display(&mut state, as_expr.as_bytes(), "=stdin") {
                    Ok(results) => {
                        if !results.is_empty() {
                            println!("{}", results.join("\t"));
                        }
                    }
                    Err(LuaError::Compile(_)) => {
                        match run_chunk_display(&mut state, line.as_bytes(), "=stdin") {
                            Ok(results) => {
                                if !results.is_empty() {
                                    println!("{}", results.join("\t"));
                                }
                            }
                            Err(e) => eprintln!("{e}"),
                        }
                    }
                    Err(e) => eprintln!("{e}"),
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => continue,
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("crescent: readline error: {e}");
                break;
            }
        }
    }
}
