use std::collections::BTreeSet;

use easy_vfs::{EntryKind, Result, VfsError, VirtualFs};

const UNKNOWN_COMMAND: &str = "Invalid or unsupported command. Type 'help' for usage.";

const HELP: &str = "Commands:
open <file>                              - Open file
close <file>                             - Close file
read <file>                              - Read file
create <file>                            - Create file
ls [dir]                                 - List contents
memmap                                   - Show memory map
mkdir <dir>                              - Create directory
chdir <dir>                              - Change directory
pwd                                      - Show current directory
move <src> <dst>                         - Move or rename file or directory
write <file> <text>                      - Append text to file
del <file|dir>                           - Delete file or directory
truncate <file> <size>                   - Truncate file to size
write_at <file> <index> <text>           - Write at position
read_start_len <file> <start> <len>      - Read partial content
move_within <file> <start> <len> <target> - Move content inside file
stat <path>                              - Show entry details
tree                                     - Show the whole tree
history                                  - Show command history
exit                                     - Flush and leave";

/// One parsed command line
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Create(&'a str),
    Delete(&'a str),
    Mkdir(&'a str),
    Chdir(&'a str),
    Move(&'a str, &'a str),
    Open(&'a str),
    Close(&'a str),
    List(Option<&'a str>),
    MemMap,
    Read(&'a str),
    ReadRange(&'a str, usize, usize),
    Write(&'a str, &'a str),
    WriteAt(&'a str, usize, &'a str),
    Truncate(&'a str, usize),
    MoveWithin(&'a str, usize, usize, usize),
    Stat(&'a str),
    Pwd,
    Tree,
    History,
    Help,
    Exit,
}

/// Split off `n` whitespace-separated words; the rest of the line is returned untouched
fn words(line: &str, n: usize) -> (Vec<&str>, &str) {
    let mut rest = line.trim_start();
    let mut v = Vec::with_capacity(n);
    while v.len() < n {
        if rest.is_empty() {
            break;
        }
        let (word, tail) = rest
            .split_once(|ch: char| ch.is_ascii_whitespace())
            .unwrap_or((rest, ""));
        v.push(word);
        rest = tail.trim_start();
    }
    (v, rest)
}

fn number(arg: &str, what: &str) -> core::result::Result<i64, String> {
    arg.parse()
        .map_err(|_| format!("{what} must be a number, got '{arg}'"))
}

/// Offsets are unsigned in the engine; negative input is a range error
fn offset(arg: &str, what: &str) -> core::result::Result<usize, String> {
    let n = number(arg, what)?;
    usize::try_from(n).map_err(|_| VfsError::RangeError(format!("{what} {n} is negative")).to_string())
}

fn size(arg: &str) -> core::result::Result<usize, String> {
    let n = number(arg, "size")?;
    usize::try_from(n).map_err(|_| VfsError::InvalidSize(n).to_string())
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> core::result::Result<Self, String> {
        let (head, rest) = words(line, 1);
        let Some(&cmd) = head.first() else {
            return Err(String::new());
        };
        let (args, tail) = words(rest, 4);
        let usage = |u: &str| format!("Usage: {u}");
        let cmd = match (cmd, args.as_slice()) {
            ("create", &[f]) if tail.is_empty() => Self::Create(f),
            ("create", _) => return Err(usage("create <file>")),
            ("del", &[p]) if tail.is_empty() => Self::Delete(p),
            ("del", _) => return Err(usage("del <file|dir>")),
            ("mkdir", &[d]) if tail.is_empty() => Self::Mkdir(d),
            ("mkdir", _) => return Err(usage("mkdir <dir>")),
            ("chdir" | "cd", &[d]) if tail.is_empty() => Self::Chdir(d),
            ("chdir" | "cd", &[]) => Self::Chdir("/"),
            ("chdir" | "cd", _) => return Err(usage("chdir <dir>")),
            ("move", &[s, d]) if tail.is_empty() => Self::Move(s, d),
            ("move", _) => return Err(usage("move <src> <dst>")),
            ("open", &[f]) if tail.is_empty() => Self::Open(f),
            ("open", _) => return Err(usage("open <file>")),
            ("close", &[f]) if tail.is_empty() => Self::Close(f),
            ("close", _) => return Err(usage("close <file>")),
            ("ls", &[]) => Self::List(None),
            ("ls", &[d]) if tail.is_empty() => Self::List(Some(d)),
            ("ls", _) => return Err(usage("ls [dir]")),
            ("memmap", &[]) => Self::MemMap,
            ("read", &[f]) if tail.is_empty() => Self::Read(f),
            ("read", _) => return Err(usage("read <file>")),
            ("read_start_len", &[f, s, l]) if tail.is_empty() => {
                Self::ReadRange(f, offset(s, "start")?, offset(l, "length")?)
            }
            ("read_start_len", _) => return Err(usage("read_start_len <file> <start> <len>")),
            ("write", &[f, ..]) => {
                // everything after the file name is text
                let (_, text) = words(rest, 1);
                if text.is_empty() {
                    return Err(usage("write <file> <text>"));
                }
                Self::Write(f, text)
            }
            ("write", _) => return Err(usage("write <file> <text>")),
            ("write_at", &[f, i, ..]) => {
                let (_, text) = words(rest, 2);
                if text.is_empty() {
                    return Err(usage("write_at <file> <index> <text>"));
                }
                Self::WriteAt(f, offset(i, "index")?, text)
            }
            ("write_at", _) => return Err(usage("write_at <file> <index> <text>")),
            ("truncate", &[f, s]) if tail.is_empty() => Self::Truncate(f, size(s)?),
            ("truncate", _) => return Err(usage("truncate <file> <size>")),
            ("move_within", &[f, s, l, t]) if tail.is_empty() => Self::MoveWithin(
                f,
                offset(s, "start")?,
                offset(l, "length")?,
                offset(t, "target")?,
            ),
            ("move_within", _) => {
                return Err(usage("move_within <file> <start> <len> <target>"))
            }
            ("stat", &[p]) if tail.is_empty() => Self::Stat(p),
            ("stat", _) => return Err(usage("stat <path>")),
            ("pwd", &[]) => Self::Pwd,
            ("tree", &[]) => Self::Tree,
            ("history", &[]) => Self::History,
            ("help", _) => Self::Help,
            ("exit" | "quit", &[]) => Self::Exit,
            _ => return Err(UNKNOWN_COMMAND.into()),
        };
        Ok(cmd)
    }
}

/// Bytes as text; zero bytes are shown as `\0`
fn render(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).replace('\0', "\\0")
}

/// Presentation shell: one engine call per command line, text out
pub struct Shell {
    fs: VirtualFs,
    opened: BTreeSet<String>,
    history: Vec<String>,
    exited: bool,
}

impl Shell {
    pub fn new(fs: VirtualFs) -> Self {
        Self {
            fs,
            opened: BTreeSet::new(),
            history: Vec::new(),
            exited: false,
        }
    }

    pub fn exited(&self) -> bool {
        self.exited
    }

    pub fn prompt(&self) -> String {
        format!("{} >> ", self.fs.pwd())
    }

    /// Run one command line; `None` for a blank line
    pub fn exec(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        self.history.push(line.to_owned());
        let out = match Command::parse(line) {
            Ok(cmd) => self.run(cmd).unwrap_or_else(|e| e.to_string()),
            Err(msg) => msg,
        };
        Some(out)
    }

    fn run(&mut self, cmd: Command) -> Result<String> {
        let out = match cmd {
            Command::Create(f) => {
                self.fs.create(f)?;
                format!("File '{f}' created.")
            }
            Command::Delete(p) => {
                let kind = self.fs.stat(p)?.kind;
                self.fs.delete(p)?;
                match kind {
                    EntryKind::File => format!("File '{p}' deleted."),
                    EntryKind::Directory => format!("Directory '{p}' deleted."),
                }
            }
            Command::Mkdir(d) => {
                self.fs.mkdir(d)?;
                format!("Directory '{d}' created.")
            }
            Command::Chdir(d) => {
                self.fs.chdir(d)?;
                format!("Current directory: {}", self.fs.pwd())
            }
            Command::Move(s, d) => {
                self.fs.rename(s, d)?;
                format!("Moved '{s}' to '{d}'.")
            }
            Command::Open(f) => {
                let h = self.fs.open(f)?;
                let (path, size) = (h.path(), h.size()?);
                self.opened.insert(path.clone());
                format!("Opened '{path}' ({size} bytes).")
            }
            Command::Close(f) => {
                let path = self.fs.stat(f)?.path;
                if !self.opened.remove(&path) {
                    return Ok(format!("File '{f}' is not open."));
                }
                format!("Closed '{f}'.")
            }
            Command::List(dir) => {
                let entries = self.fs.list(dir.unwrap_or("."))?;
                if entries.is_empty() {
                    return Ok("(empty)".into());
                }
                entries
                    .into_iter()
                    .map(|(name, kind)| match kind {
                        EntryKind::Directory => format!("{name}/"),
                        EntryKind::File => name,
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Command::MemMap => self.fs.memory_map(),
            Command::Read(f) => render(&self.fs.open(f)?.read()?),
            Command::ReadRange(f, start, len) => render(&self.fs.open(f)?.read_range(start, len)?),
            Command::Write(f, text) => {
                self.fs.open(f)?.write_append(text.as_bytes())?;
                "Text written.".into()
            }
            Command::WriteAt(f, index, text) => {
                self.fs.open(f)?.write_at(index, text.as_bytes())?;
                format!("Text written at index {index}.")
            }
            Command::Truncate(f, size) => {
                self.fs.open(f)?.truncate(size)?;
                format!("File '{f}' truncated to {size} bytes.")
            }
            Command::MoveWithin(f, start, len, target) => {
                self.fs.open(f)?.move_within(start, len, target)?;
                format!("Moved {len} bytes from {start} to {target} in '{f}'.")
            }
            Command::Stat(p) => {
                let st = self.fs.stat(p)?;
                match st.kind {
                    EntryKind::Directory => format!("{}: directory, {} entries", st.path, st.size),
                    EntryKind::File => format!(
                        "{}: file, {} bytes, {} segments, blocks {:?}",
                        st.path,
                        st.size,
                        st.blocks.len(),
                        st.blocks
                    ),
                }
            }
            Command::Pwd => self.fs.pwd(),
            Command::Tree => self.fs.tree(),
            Command::History => self
                .history
                .iter()
                .enumerate()
                .map(|(i, l)| format!("{:>4}  {l}", i + 1))
                .collect::<Vec<_>>()
                .join("\n"),
            Command::Help => HELP.into(),
            Command::Exit => {
                self.exited = true;
                "Bye.".into()
            }
        };
        Ok(out)
    }

    /// Final flush of the engine
    pub fn close(self) -> Result<()> {
        self.fs.close()
    }
}
