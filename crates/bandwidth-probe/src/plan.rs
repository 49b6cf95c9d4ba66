use crate::{
    Error, Result,
    types::{Direction, TestCase},
};

const KB: u64 = 1_000;
const MB: u64 = 1_000_000;

/// An ordered, validated sequence of test cases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPlan {
    cases: Vec<TestCase>,
}

impl TestPlan {
    pub fn new(cases: Vec<TestCase>) -> Result<Self> {
        if cases.is_empty() {
            return Err(Error::InvalidPlan("plan has no test cases".to_string()));
        }

        for (idx, case) in cases.iter().enumerate() {
            if case.payload_size_bytes == 0 {
                return Err(Error::InvalidPlan(format!(
                    "test case {idx} has a zero payload size"
                )));
            }
            if case.iterations == 0 {
                return Err(Error::InvalidPlan(format!(
                    "test case {idx} has zero iterations"
                )));
            }
        }

        Ok(Self { cases })
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    /// Number of probes the plan will issue, used to size the pipeline channels.
    pub fn total_iterations(&self) -> usize {
        self.cases.iter().map(|case| case.iterations as usize).sum()
    }

    pub fn iterations_for(&self, direction: Direction) -> usize {
        self.cases
            .iter()
            .filter(|case| case.direction == direction)
            .map(|case| case.iterations as usize)
            .sum()
    }
}

impl Default for TestPlan {
    fn default() -> Self {
        Self {
            cases: default_cases(),
        }
    }
}

/// Download sizes from 100 KB to 100 MB followed by upload sizes from 100 KB to
/// 50 MB, with fewer iterations as the payload grows.
pub fn default_cases() -> Vec<TestCase> {
    vec![
        TestCase::download(100 * KB, 10),
        TestCase::download(MB, 8),
        TestCase::download(10 * MB, 6),
        TestCase::download(25 * MB, 6),
        TestCase::download(100 * MB, 3),
        TestCase::upload(100 * KB, 8),
        TestCase::upload(MB, 6),
        TestCase::upload(10 * MB, 4),
        TestCase::upload(25 * MB, 4),
        TestCase::upload(50 * MB, 3),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_plan_totals() {
        let plan = TestPlan::default();

        assert_eq!(plan.cases().len(), 10);
        assert_eq!(plan.iterations_for(Direction::Download), 33);
        assert_eq!(plan.iterations_for(Direction::Upload), 25);
        assert_eq!(plan.total_iterations(), 58);
    }

    #[test]
    fn default_plan_is_valid() {
        assert!(TestPlan::new(default_cases()).is_ok());
    }

    #[test]
    fn default_plan_downloads_before_uploads() {
        let plan = TestPlan::default();
        let first_upload = plan
            .cases()
            .iter()
            .position(|c| c.direction == Direction::Upload)
            .unwrap();

        assert!(
            plan.cases()[first_upload..]
                .iter()
                .all(|c| c.direction == Direction::Upload)
        );
    }

    #[test]
    fn rejects_empty_plan() {
        assert!(matches!(TestPlan::new(vec![]), Err(Error::InvalidPlan(_))));
    }

    #[test]
    fn rejects_zero_payload_and_zero_iterations() {
        let zero_payload = vec![TestCase::download(0, 1)];
        assert!(matches!(
            TestPlan::new(zero_payload),
            Err(Error::InvalidPlan(_))
        ));

        let zero_iterations = vec![TestCase::download(MB, 1), TestCase::upload(MB, 0)];
        let err = TestPlan::new(zero_iterations).unwrap_err();
        assert!(err.to_string().contains("test case 1"));
    }
}
