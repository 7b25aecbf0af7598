use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;

/// One observed `(user, item, value)` interaction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Interaction {
    pub user_id: i64,
    pub item_id: i64,
    pub value: f64,
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("i/o error reading dataset")]
    Io(#[from] std::io::Error),
    #[error("the file format is incorrect: {line}")]
    BadFormat { line: String },
}

/// Line-oriented reader for the plain-text interaction format:
/// `<userId> <itemId> <value>` per line, integer ids, integer value.
pub struct DatasetReader<R> {
    reader: R,
    line: String,
}

impl DatasetReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> DatasetReader<R> {
    pub fn new(reader: R) -> Self {
        DatasetReader {
            reader,
            line: String::new(),
        }
    }

    /// Reads the next interaction, or `None` at end of input.
    pub fn read_one(&mut self) -> Result<Option<Interaction>, DatasetError> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Ok(None);
        }
        match parse_line(&self.line) {
            Some(elem) => Ok(Some(elem)),
            None => Err(DatasetError::BadFormat {
                line: self.line.trim_end_matches('\n').to_string(),
            }),
        }
    }

    /// Reads the remaining stream.
    pub fn read_all(mut self) -> Result<Vec<Interaction>, DatasetError> {
        let mut dataset = Vec::new();
        while let Some(elem) = self.read_one()? {
            dataset.push(elem);
        }
        Ok(dataset)
    }
}

fn parse_line(line: &str) -> Option<Interaction> {
    let mut fields = line.split_whitespace();
    let user_id = fields.next()?.parse::<i64>().ok()?;
    let item_id = fields.next()?.parse::<i64>().ok()?;
    let value = fields.next()?.parse::<i32>().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(Interaction {
        user_id,
        item_id,
        value: f64::from(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_one() {
        let mut reader = DatasetReader::new(Cursor::new("1 2 3"));
        let elem = reader.read_one().unwrap().unwrap();
        assert_eq!(elem.user_id, 1);
        assert_eq!(elem.item_id, 2);
        assert_eq!(elem.value, 3.0);
        assert!(reader.read_one().unwrap().is_none());
    }

    #[test]
    fn read_one_bad_format() {
        let mut reader = DatasetReader::new(Cursor::new("1 3\n"));
        assert!(matches!(
            reader.read_one(),
            Err(DatasetError::BadFormat { .. })
        ));
    }

    #[test]
    fn rejects_extra_fields_and_non_integers() {
        for line in ["1 2 3 4", "1 2 x", "1 2 3.5", ""] {
            let mut reader = DatasetReader::new(Cursor::new(format!("{line}\n")));
            assert!(
                matches!(reader.read_one(), Err(DatasetError::BadFormat { .. })),
                "line {line:?} should be rejected"
            );
        }
    }

    #[test]
    fn read_all() {
        let nelems = 5;
        let input = "1 2 3\n".repeat(nelems);
        let dataset = DatasetReader::new(Cursor::new(input)).read_all().unwrap();
        assert_eq!(dataset.len(), nelems);
        for elem in dataset {
            assert_eq!(
                elem,
                Interaction {
                    user_id: 1,
                    item_id: 2,
                    value: 3.0
                }
            );
        }
    }

    #[test]
    fn negative_ids_and_values() {
        let mut reader = DatasetReader::new(Cursor::new("-4 -9 -1\n"));
        let elem = reader.read_one().unwrap().unwrap();
        assert_eq!(elem.user_id, -4);
        assert_eq!(elem.item_id, -9);
        assert_eq!(elem.value, -1.0);
    }
}
