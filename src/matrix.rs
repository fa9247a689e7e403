//! Custom-image matrix expansion.
//!
//! A flat list of custom-image entries expands into rows, each row a
//! complete assignment of one entry per distinct target. Targets appear
//! as columns in order of first appearance; alternative entries for a
//! target multiply the rows that carry the target's first entry.

use crate::resolver::CustomImage;

/// Expands custom-image entries into instance rows.
///
/// The output order is a pure function of the input order: feeding the
/// same list twice yields identical row sequences.
pub fn expand_custom_image_matrix(images: &[CustomImage]) -> Vec<Vec<CustomImage>> {
    let mut matrix: Vec<Vec<CustomImage>> = Vec::with_capacity(images.len());
    for img in images {
        if matrix.is_empty() {
            matrix.push(vec![img.clone()]);
            continue;
        }

        let column = matrix[0]
            .iter()
            .position(|existing| existing.target == img.target);

        match column {
            Some(i) => {
                // Duplicate each row still carrying the first entry for
                // this column, substituting the new entry.
                let existing_rows = matrix.len();
                for j in 0..existing_rows {
                    if j > 0 && matrix[0][i] != matrix[j][i] {
                        continue;
                    }
                    let mut row = matrix[j].clone();
                    row[i] = img.clone();
                    matrix.push(row);
                }
            }
            None => {
                // New column: extend every row.
                for row in matrix.iter_mut() {
                    row.push(img.clone());
                }
            }
        }
    }

    matrix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{parse_reference, TaggedRef};

    fn image(source: &str, target: &str, version: &str) -> CustomImage {
        CustomImage {
            source: parse_reference(source).unwrap(),
            target: TaggedRef::parse(target).unwrap(),
            version: version.to_string(),
            default_only: false,
        }
    }

    #[test]
    fn matrix_expansion() {
        let start = vec![
            image("golem-image1", "image1:latest", "1.10.1"),
            image("golem-image2", "image2:latest", "1.10.1"),
            image("golem-image3", "image3:latest", "1.10.1"),
            image("golem-image2", "image2:latest", "1.10.2"),
            image("golem-image2", "image2:latest", "1.10.3"),
            image("golem-image1", "image1:latest", "1.11.1"),
            image("golem-image4", "image4:latest", "1.10.1"),
        ];
        let expected = vec![
            vec![
                start[0].clone(),
                start[1].clone(),
                start[2].clone(),
                start[6].clone(),
            ],
            vec![
                start[0].clone(),
                start[3].clone(),
                start[2].clone(),
                start[6].clone(),
            ],
            vec![
                start[0].clone(),
                start[4].clone(),
                start[2].clone(),
                start[6].clone(),
            ],
            vec![
                start[5].clone(),
                start[1].clone(),
                start[2].clone(),
                start[6].clone(),
            ],
            vec![
                start[5].clone(),
                start[3].clone(),
                start[2].clone(),
                start[6].clone(),
            ],
            vec![
                start[5].clone(),
                start[4].clone(),
                start[2].clone(),
                start[6].clone(),
            ],
        ];

        let expanded = expand_custom_image_matrix(&start);
        assert_eq!(expanded, expected);
    }

    #[test]
    fn singleton_per_target_yields_one_row() {
        let start = vec![
            image("src-a", "a:latest", "1"),
            image("src-b", "b:latest", "1"),
            image("src-c", "c:latest", "1"),
        ];
        let expanded = expand_custom_image_matrix(&start);
        assert_eq!(expanded, vec![start]);
    }

    #[test]
    fn row_count_is_product_of_alternatives() {
        let start = vec![
            image("a1", "a:latest", "1"),
            image("a2", "a:latest", "2"),
            image("b1", "b:latest", "1"),
            image("b2", "b:latest", "2"),
            image("b3", "b:latest", "3"),
        ];
        let expanded = expand_custom_image_matrix(&start);
        assert_eq!(expanded.len(), 6);
    }

    #[test]
    fn expansion_is_deterministic() {
        let start = vec![
            image("a1", "a:latest", "1"),
            image("b1", "b:latest", "1"),
            image("a2", "a:latest", "2"),
            image("b2", "b:latest", "2"),
        ];
        assert_eq!(
            expand_custom_image_matrix(&start),
            expand_custom_image_matrix(&start)
        );
    }

    #[test]
    fn empty_input_yields_no_rows() {
        assert!(expand_custom_image_matrix(&[]).is_empty());
    }
}
