use std::fmt::{self, Display, Formatter};

use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::*;

use crate::sample::{BootstrapSample, Parameter};
use crate::statistics::{Mean, ShortestCoverage, Statistic, Variance};

fn number(x: f64) -> String {
    if x.is_nan() {
        "—".to_string()
    } else if x != 0.0 && (x.abs() >= 1e5 || x.abs() < 1e-3) {
        format!("{x:.3e}")
    } else {
        format!("{x:.4}")
    }
}

impl BootstrapSample {
    /// Parameter summary and run footer as box-drawn tables.
    pub fn display(&self) -> String {
        let tol = self.singular_tol();

        let mut title_table = Table::new();
        title_table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .add_row(vec![
                Cell::new("Parametric Bootstrap").set_alignment(CellAlignment::Center),
            ]);

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_content_arrangement(ContentArrangement::Disabled)
            .set_header(vec![
                Cell::new("Parameter").set_alignment(CellAlignment::Center),
                Cell::new("Mean").set_alignment(CellAlignment::Center),
                Cell::new("Std. Error").set_alignment(CellAlignment::Center),
                Cell::new("95% shortest coverage").set_alignment(CellAlignment::Center),
            ]);

        let coverage = ShortestCoverage::new(0.95);
        for parameter in self.parameters() {
            if matches!(parameter, Parameter::Theta(_)) {
                continue;
            }
            let column = self.column(&parameter);
            let (mean, var): (f64, f64) = (Mean, Variance::default()).compute(&column);
            let ci = coverage.compute(&self.ecdf(&parameter));
            table.add_row(vec![
                Cell::new(self.parameter_name(&parameter)).set_alignment(CellAlignment::Left),
                Cell::new(number(mean)).set_alignment(CellAlignment::Right),
                Cell::new(number(var.sqrt())).set_alignment(CellAlignment::Right),
                Cell::new(format!("[{}, {}]", number(ci.lower), number(ci.upper)))
                    .set_alignment(CellAlignment::Right),
            ]);
        }

        let mut footer = Table::new();
        footer
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .add_row(vec![
                Cell::new("Replicates"),
                Cell::new(format!("{} of {}", self.len(), self.requested()))
                    .set_alignment(CellAlignment::Right),
            ])
            .add_row(vec![
                Cell::new(format!("Singular (tol {tol:.0e})")),
                Cell::new(format!(
                    "{} ({:.1}%)",
                    self.singular_count(tol),
                    100.0 * self.singular_fraction(tol)
                ))
                .set_alignment(CellAlignment::Right),
            ])
            .add_row(vec![
                Cell::new("Not converged"),
                Cell::new(self.nonconverged().to_string()).set_alignment(CellAlignment::Right),
            ]);

        format!("{title_table}\n{table}\n{footer}")
    }
}

impl Display for BootstrapSample {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}

#[cfg(test)]
mod tests {
    use crate::sample::tests::sample;

    #[test]
    fn summary_lists_every_reported_parameter() {
        let text = sample().to_string();
        assert!(text.contains("Parametric Bootstrap"));
        assert!(text.contains("(Intercept)"));
        assert!(text.contains("ρ subject: (Intercept), day"));
        assert!(text.contains("σ item: (Intercept)"));
        assert!(text.contains("4 of 4"));
        assert!(!text.contains("θ1"));
    }
}
