use super::Controller;

#[derive(Debug, Clone)]

pub struct NoControl;

impl Controller for NoControl {
    fn window(&self) -> usize {
        usize::MAX
    }
}
