//! Classification report and confusion matrix.

use std::fmt;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use smartcore::metrics::accuracy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub class_names: Vec<String>,
    /// `counts[[true, predicted]]`
    pub counts: Array2<usize>,
}

impl ConfusionMatrix {
    pub fn new(y_true: &[u8], y_pred: &[u8], class_names: &[String]) -> Self {
        let n = class_names.len();
        let mut counts = Array2::zeros((n, n));
        for (&t, &p) in y_true.iter().zip(y_pred) {
            let (t, p) = (t as usize, p as usize);
            if t < n && p < n {
                counts[[t, p]] += 1;
            }
        }
        Self {
            class_names: class_names.to_vec(),
            counts,
        }
    }

    pub fn total(&self) -> usize {
        self.counts.sum()
    }

    pub fn max_count(&self) -> usize {
        self.counts.iter().copied().max().unwrap_or(0)
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .class_names
            .iter()
            .map(String::len)
            .max()
            .unwrap_or(0)
            .max(6);
        write!(f, "{:>width$}", "")?;
        for name in &self.class_names {
            write!(f, " {name:>width$}")?;
        }
        writeln!(f)?;
        for (name, row) in self.class_names.iter().zip(self.counts.rows()) {
            write!(f, "{name:>width$}")?;
            for count in row {
                write!(f, " {count:>width$}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassScores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Per-class precision/recall/F1 with macro and weighted averages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub class_names: Vec<String>,
    pub per_class: Vec<ClassScores>,
    pub accuracy: f64,
    pub macro_avg: ClassScores,
    pub weighted_avg: ClassScores,
}

fn ratio(num: usize, den: usize) -> f64 {
    // undefined scores count as zero
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl ClassificationReport {
    pub fn new(y_true: &[u8], y_pred: &[u8], class_names: &[String]) -> Self {
        let cm = ConfusionMatrix::new(y_true, y_pred, class_names);
        let n = class_names.len();

        let per_class: Vec<ClassScores> = (0..n)
            .map(|c| {
                let tp = cm.counts[[c, c]];
                let predicted: usize = cm.counts.column(c).sum();
                let support: usize = cm.counts.row(c).sum();
                let precision = ratio(tp, predicted);
                let recall = ratio(tp, support);
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassScores {
                    precision,
                    recall,
                    f1,
                    support,
                }
            })
            .collect();

        let total: usize = per_class.iter().map(|s| s.support).sum();
        let average = |weight: &dyn Fn(&ClassScores) -> f64, norm: f64| {
            let score = |get: fn(&ClassScores) -> f64| {
                if norm == 0.0 {
                    0.0
                } else {
                    per_class.iter().map(|s| weight(s) * get(s)).sum::<f64>() / norm
                }
            };
            ClassScores {
                precision: score(|s| s.precision),
                recall: score(|s| s.recall),
                f1: score(|s| s.f1),
                support: total,
            }
        };
        let macro_avg = average(&|_: &ClassScores| 1.0, n as f64);
        let weighted_avg = average(&|s: &ClassScores| s.support as f64, total as f64);

        let accuracy = if y_true.is_empty() {
            0.0
        } else {
            accuracy(&y_true.to_vec(), &y_pred.to_vec())
        };

        Self {
            class_names: class_names.to_vec(),
            per_class,
            accuracy,
            macro_avg,
            weighted_avg,
        }
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .class_names
            .iter()
            .map(String::len)
            .max()
            .unwrap_or(0)
            .max("weighted avg".len());
        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;
        for (name, s) in self.class_names.iter().zip(&self.per_class) {
            writeln!(
                f,
                "{name:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                s.precision, s.recall, s.f1, s.support
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        )?;
        for (label, s) in [("macro avg", &self.macro_avg), ("weighted avg", &self.weighted_avg)] {
            writeln!(
                f,
                "{label:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                s.precision, s.recall, s.f1, s.support
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("c{i}")).collect()
    }

    #[test]
    fn test_confusion_matrix_counts() {
        let cm = ConfusionMatrix::new(&[0, 0, 1, 2, 2, 2], &[0, 1, 1, 2, 0, 2], &names(3));
        assert_eq!(cm.counts[[0, 0]], 1);
        assert_eq!(cm.counts[[0, 1]], 1);
        assert_eq!(cm.counts[[1, 1]], 1);
        assert_eq!(cm.counts[[2, 0]], 1);
        assert_eq!(cm.counts[[2, 2]], 2);
        assert_eq!(cm.total(), 6);
        assert_eq!(cm.max_count(), 2);
    }

    #[test]
    fn test_report_scores() {
        let report = ClassificationReport::new(&[0, 0, 1, 1], &[0, 1, 1, 1], &names(2));
        assert!((report.accuracy - 0.75).abs() < 1e-12);

        let c0 = report.per_class[0];
        assert_eq!(c0.support, 2);
        assert!((c0.precision - 1.0).abs() < 1e-12);
        assert!((c0.recall - 0.5).abs() < 1e-12);

        let c1 = report.per_class[1];
        assert!((c1.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((c1.recall - 1.0).abs() < 1e-12);
        assert!((c1.f1 - 0.8).abs() < 1e-12);

        assert!((report.macro_avg.recall - 0.75).abs() < 1e-12);
        assert_eq!(report.weighted_avg.support, 4);
    }

    #[test]
    fn test_unpredicted_class_scores_zero() {
        let report = ClassificationReport::new(&[0, 1, 2], &[0, 0, 0], &names(3));
        assert_eq!(report.per_class[2].precision, 0.0);
        assert_eq!(report.per_class[2].f1, 0.0);
    }

    #[test]
    fn test_display_lists_every_class() {
        let report = ClassificationReport::new(&[0, 1], &[0, 1], &names(2));
        let text = report.to_string();
        assert!(text.contains("c0") && text.contains("c1"));
        assert!(text.contains("weighted avg"));
        assert!(text.contains("1.00"));
    }
}
