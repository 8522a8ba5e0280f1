use crate::helpe::*;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path:   PathBuf,
        source: std::io::Error,
    },
    #[error("line {line}: {message}")]
    Malformed {
        line:       usize,
        message:    String,
    },
}

/// Anything able to produce the values of a [Program].
///
/// To write your own interface, implement this trait for a
/// type that knows where its data lives.
pub trait ValueGen<T> {
    fn new(path: PathBuf) -> Self;
    fn read_values(&self) -> Result<Vec<Value>, InputError>;
    fn gen_single(&self, d: T, line: usize) -> Result<Value, InputError>;
}

/// We adopt [`minimalloc`'s CSV](https://github.com/google/minimalloc)
/// as the most standard format: `id,lower,upper,size`, one value per
/// line, lives on `[lower, upper)`. An optional fifth column lists
/// space-separated use times; without it the value is read once, at
/// `upper - 1`.
///
/// Values are renumbered densely in row order. The file's own ID
/// survives in the name (`v<id>`).
pub struct MinimalloCSVParser {
    pub path: PathBuf,
}

impl MinimalloCSVParser {
    /// Same as [ValueGen::read_values], from any reader.
    pub fn parse<R: BufRead>(&self, reader: R) -> Result<Vec<Value>, InputError> {
        let mut res = vec![];
        for (idx, line) in reader.lines()
            .enumerate()
            // First line is the header!
            .skip(1) {
            let line = line.map_err(|source| InputError::Io {
                path: self.path.clone(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let mut v = self.gen_single(&line, idx + 1)?;
            v.id = res.len() as ValueId;
            v.group = v.id;
            res.push(v);
        }

        Ok(res)
    }
}

impl ValueGen<&str> for MinimalloCSVParser {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
        }
    }

    fn read_values(&self) -> Result<Vec<Value>, InputError> {
        let fd = std::fs::File::open(&self.path).map_err(|source| InputError::Io {
            path: self.path.clone(),
            source,
        })?;

        self.parse(BufReader::new(fd))
    }

    fn gen_single(&self, d: &str, line: usize) -> Result<Value, InputError> {
        let malformed = |message: String| InputError::Malformed { line, message };
        let cols: Vec<&str> = d.split(',')
            .map(|c| c.trim())
            .collect();
        if cols.len() < 4 {
            return Err(malformed(format!("expected at least 4 columns, found {}", cols.len())));
        }
        let number = |idx: usize| -> Result<i64, InputError> {
            cols[idx].parse::<i64>()
                .map_err(|e| malformed(format!("column {}: {e}", idx + 1)))
        };
        let id = ValueId::try_from(number(0)?)
            .map_err(|e| malformed(format!("bad ID: {e}")))?;
        let (lower, upper) = (number(1)?, number(2)?);
        let size = ByteSteps::try_from(number(3)?)
            .map_err(|e| malformed(format!("bad size: {e}")))?;
        if lower < 0 || upper <= lower {
            return Err(malformed(format!("empty lifetime [{lower}, {upper})")));
        }

        let uses: Vec<Time> = match cols.get(4).filter(|c| !c.is_empty()) {
            Some(c) => c.split_whitespace()
                .map(|u| u.parse::<Time>().map_err(|e| malformed(format!("bad use `{u}`: {e}"))))
                .collect::<Result<_, _>>()?,
            None    => vec![upper - 1],
        };

        Ok(Value::new(id, &format!("v{id}"), size, lower, &uses))
    }
}

/// Reads one elapsed time per line. Blank lines are skipped.
pub fn read_elapsed(path: &PathBuf) -> Result<Vec<f64>, InputError> {
    let fd = std::fs::File::open(path).map_err(|source| InputError::Io {
        path: path.clone(),
        source,
    })?;
    let mut res = vec![];
    for (idx, line) in BufReader::new(fd).lines().enumerate() {
        let line = line.map_err(|source| InputError::Io {
            path: path.clone(),
            source,
        })?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        res.push(line.parse::<f64>().map_err(|e| InputError::Malformed {
            line:       idx + 1,
            message:    format!("bad elapsed time: {e}"),
        })?);
    }

    Ok(res)
}
