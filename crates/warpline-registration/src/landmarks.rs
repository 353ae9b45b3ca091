use std::io::{BufRead, Write};

use crate::error::RegistrationError;

const HEADER: &str = "Index\txSource\tySource\txTarget\tyTarget";

/// One point correspondence between the source and target images.
///
/// A landmark is a single record, so the two point lists cannot drift
/// out of step: adding, removing or moving a correspondence always
/// affects both ends together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Landmark {
    /// Pixel position in the source image.
    pub source: [i32; 2],
    /// Pixel position in the target image.
    pub target: [i32; 2],
}

/// Read landmarks from the tab-separated exchange format.
///
/// # Errors
///
/// Malformed headers or rows are reported with their one-based line
/// number; nothing is returned for a partially readable file.
pub fn read_landmarks<R: BufRead>(reader: R) -> Result<Vec<Landmark>, RegistrationError> {
    let mut lines = reader.lines();
    let header = lines
        .next()
        .transpose()?
        .ok_or_else(|| RegistrationError::LandmarkParse {
            line: 1,
            message: format!("expected header '{HEADER}'"),
        })?;
    if header.trim_end() != HEADER {
        return Err(RegistrationError::LandmarkParse {
            line: 1,
            message: format!("expected header '{HEADER}'"),
        });
    }

    let mut landmarks = Vec::new();
    for (idx, line) in lines.enumerate() {
        let line_number = idx + 2;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(RegistrationError::LandmarkParse {
                line: line_number,
                message: format!("expected 5 fields, got {}", fields.len()),
            });
        }
        let mut values = [0i32; 4];
        for (v, field) in values.iter_mut().zip(&fields[1..]) {
            *v = field
                .parse()
                .map_err(|_| RegistrationError::LandmarkParse {
                    line: line_number,
                    message: format!("'{field}' is not an integer coordinate"),
                })?;
        }
        landmarks.push(Landmark {
            source: [values[0], values[1]],
            target: [values[2], values[3]],
        });
    }
    Ok(landmarks)
}

/// Write landmarks in the tab-separated exchange format.
pub fn write_landmarks<W: Write>(mut writer: W, landmarks: &[Landmark]) -> std::io::Result<()> {
    writeln!(writer, "{HEADER}")?;
    for (i, lm) in landmarks.iter().enumerate() {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}",
            i, lm.source[0], lm.source[1], lm.target[0], lm.target[1]
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let landmarks = vec![
            Landmark {
                source: [3, 4],
                target: [5, 6],
            },
            Landmark {
                source: [-1, 0],
                target: [10, 20],
            },
        ];
        let mut buf = Vec::new();
        write_landmarks(&mut buf, &landmarks).unwrap();
        let parsed = read_landmarks(buf.as_slice()).unwrap();
        assert_eq!(parsed, landmarks);
    }

    #[test]
    fn test_bad_header_is_line_one() {
        let err = read_landmarks("nope\n1\t2\t3\t4\t5\n".as_bytes()).unwrap_err();
        match err {
            RegistrationError::LandmarkParse { line, .. } => assert_eq!(line, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_short_row_reports_line() {
        let text = format!("{HEADER}\n0\t1\t2\t3\t4\n1\t2\t3\n");
        let err = read_landmarks(text.as_bytes()).unwrap_err();
        match err {
            RegistrationError::LandmarkParse { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_non_numeric_field() {
        let text = format!("{HEADER}\n0\t1\tx\t3\t4\n");
        let err = read_landmarks(text.as_bytes()).unwrap_err();
        match err {
            RegistrationError::LandmarkParse { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }
}
